mod tests_payload;
