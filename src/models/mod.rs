pub mod enums;
pub mod patient;
pub mod prediction;

pub use enums::DiseaseLabel;
pub use patient::Patient;
pub use prediction::*;
