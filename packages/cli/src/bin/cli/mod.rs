pub mod cleanup;
pub mod scan;
pub mod timeouts;
