mod tests_queries;
