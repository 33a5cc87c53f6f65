#![forbid(unsafe_code)]

pub mod decision_path;
pub mod evidence;
