pub mod delivery_test;
pub mod error_scenarios;
pub mod worker_test;
