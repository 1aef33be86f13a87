pub mod topology;
pub mod tunnel;
pub mod plan;
pub mod run_context;
pub mod provisioning;
pub mod execution;
pub mod orchestration;
pub mod report;

/// Helper macro to convert Vec<&str> to Vec<String> to avoid having to keep writing `.to_string()`
#[macro_export]
macro_rules! vec_of_strings {
    ($($x:expr),*) => (vec![$($x.to_string()),*]);
}
