pub mod builder;
pub mod maestro;
