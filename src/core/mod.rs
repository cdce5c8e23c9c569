pub mod analysis;
pub mod catalog;
pub mod domain;
pub mod pipeline;
pub mod service;
pub mod traits;
pub mod validation;
