mod tests_variants;
