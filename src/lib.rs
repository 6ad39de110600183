// This is a successor of the artisan_platform process supervisor
pub mod config;
pub mod context;
pub mod error;
pub mod handlers;
pub mod ipc;
pub mod launcher;
pub mod ledger;
pub mod lifecycle;
pub mod logger;
pub mod master;
pub mod process_manager;
pub mod resource_monitor;
pub mod socket_communication;
pub mod supervisor;
pub mod timestamp;
pub mod worker;

// tests
#[path = "../src/tests/config_test.rs"]
mod config_test;

#[path = "../src/tests/handlers_test.rs"]
mod handlers_test;

#[path = "../src/tests/ipc_test.rs"]
mod ipc_test;

#[path = "../src/tests/ledger_test.rs"]
mod ledger_test;

#[path = "../src/tests/lifecycle_test.rs"]
mod lifecycle_test;

#[path = "../src/tests/logger_test.rs"]
mod logger_test;

#[path = "../src/tests/process_manager_test.rs"]
mod process_manager_test;

#[path = "../src/tests/resource_monitor_test.rs"]
mod resource_monitor_test;

#[path = "../src/tests/socket_communication.rs"]
mod socket_communication_test;

#[path = "../src/tests/supervisor_test.rs"]
mod supervisor_test;

#[path = "../src/tests/worker_test.rs"]
mod worker_test;
