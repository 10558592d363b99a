mod tests_limits;
