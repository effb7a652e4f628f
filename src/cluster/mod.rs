pub mod clusterer;
pub mod gmm;
pub mod reduce;

pub use clusterer::GmmRaptorClusterer;
