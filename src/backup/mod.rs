pub mod backup_type;
pub mod controller;
pub mod disk;
pub mod engine;
pub mod executor;
pub mod file_ext;
pub mod planner;
pub mod result_error;
pub mod run_config;
pub mod run_lock;
pub mod selector;
pub mod validate;

macro_rules! function_path {
    () => {
        concat!(module_path!(), "::", function_name!(), " ", file!(), ":", line!())
    };
}

pub(crate) use function_path;
