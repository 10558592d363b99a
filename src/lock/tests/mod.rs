mod tests_modes;
mod tests_waits;
