mod catalogue;

pub use catalogue::{ImageModel, ProviderKind, UnsupportedModel};
