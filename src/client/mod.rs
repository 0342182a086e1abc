//! Client module - request types, the generator trait and the Azure client

pub mod azure;
pub mod traits;
pub mod types;

pub use azure::AzureImageClient;
pub use traits::{ClientConfig, ImageGenerator};
pub use types::{
    ApiVersion, GeneratedImage, GenerationRequest, GenerationResult, ImageSize, Quality, Style,
    AS_IS_PREFIX,
};
