pub mod augmentation;
pub mod bucketing;
pub mod encoding;
pub mod loading;
pub mod paths;

pub use augmentation::*;
pub use bucketing::*;
pub use encoding::*;
pub use loading::*;
pub use paths::*;
