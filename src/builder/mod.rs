pub mod pacer;
pub mod raptor_builder;

pub use pacer::Pacer;
pub use raptor_builder::RaptorBuilder;
