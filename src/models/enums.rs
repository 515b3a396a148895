use crate::db::DatabaseError;
use serde::{Deserialize, Serialize};

/// Macro to generate enum with as_str + std::str::FromStr pattern.
///
/// Variant order is significant: it defines `Ord`, which the ensemble
/// uses as the tie-break between equal confidence scores.
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal : $display:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $s)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$(Self::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }

            pub fn display_name(&self) -> &'static str {
                match self {
                    $(Self::$variant => $display),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(DatabaseError::InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }
    };
}

str_enum!(DiseaseLabel {
    Cardiomegaly => "cardiomegaly" : "Cardiomegaly",
    Pneumonia => "pneumonia" : "Pneumonia",
    Tuberculosis => "tuberculosis" : "Tuberculosis",
    PulmonaryHypertension => "pulmonary_hypertension" : "Pulmonary Hypertension",
});

impl DiseaseLabel {
    /// Default model file stem, e.g. `pneumonia_model`.
    pub fn model_stem(&self) -> String {
        format!("{}_model", self.as_str())
    }
}
