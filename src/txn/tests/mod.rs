mod tests_undo;
