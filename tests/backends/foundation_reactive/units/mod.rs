mod exchange_tests;
mod retry_tests;
