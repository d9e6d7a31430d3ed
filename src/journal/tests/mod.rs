mod tests_protocol;
