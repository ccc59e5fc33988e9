mod helpers;

mod tests_concurrency;
