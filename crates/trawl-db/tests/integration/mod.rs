mod common;
mod job_queue_tests;
mod listing_tests;
mod log_tests;
mod status_tests;
