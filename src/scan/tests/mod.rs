mod tests_forward;
