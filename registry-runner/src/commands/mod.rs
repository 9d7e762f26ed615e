pub mod destroy;
pub mod outputs;
pub mod plan;
pub mod up;
