//! Static informational pages, compiled into the binary.

pub const INDEX: &str = include_str!("../templates/index.html");

pub const HOW_IT_WORKS: &str = include_str!("../templates/how.html");

pub const DATASET: &str = include_str!("../templates/dataset.html");
