pub mod fixtures;

pub use fixtures::{chunk, output_for, receiver, record, wait_until};
