//! Category code table
//!
//! Maps the four categorical dimensions of a question (exam type, exam class,
//! top-level subject, question kind) to single-character codes. Every
//! dimension is a closed enumeration with an explicit `Unmapped` variant, so a
//! value missing from the table is visible in the type rather than being a
//! silent lookup miss. Unmapped values encode as [`SENTINEL_CODE`].

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Code emitted for any value the table does not know
pub const SENTINEL_CODE: char = 'X';

/// A category value that fell back to the sentinel code
///
/// Never an error: callers collect these and report them as data-quality
/// warnings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmappedCategory {
    /// Dimension name (e.g. "exam_type")
    pub dimension: String,
    /// The raw value that had no code
    pub value: String,
}

impl fmt::Display for UnmappedCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unmapped {} '{}'", self.dimension, self.value)
    }
}

/// Common surface of the four category dimensions
pub trait CategoryDimension {
    /// Dimension name used in warnings
    const NAME: &'static str;

    /// Single-character code, or the sentinel for unmapped values
    fn code(&self) -> char;

    /// Raw value when the dimension fell back to the sentinel
    fn unmapped_value(&self) -> Option<&str>;
}

macro_rules! category_dimension {
    (
        $(#[$meta:meta])*
        $name:ident, $dim:literal {
            $( $variant:ident => $code:literal, [$($label:literal),+ $(,)?] ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $variant, )+
            /// Value with no entry in the code table
            Unmapped(String),
        }

        impl $name {
            /// Parse a raw value; never fails
            pub fn parse(raw: &str) -> Self {
                match raw.trim() {
                    $( $($label)|+ => $name::$variant, )+
                    other => $name::Unmapped(other.to_string()),
                }
            }

            /// Canonical label written back to stores
            pub fn label(&self) -> &str {
                match self {
                    $( $name::$variant => [$($label),+][0], )+
                    $name::Unmapped(raw) => raw.as_str(),
                }
            }
        }

        impl CategoryDimension for $name {
            const NAME: &'static str = $dim;

            fn code(&self) -> char {
                match self {
                    $( $name::$variant => $code, )+
                    $name::Unmapped(_) => SENTINEL_CODE,
                }
            }

            fn unmapped_value(&self) -> Option<&str> {
                match self {
                    $name::Unmapped(raw) => Some(raw.as_str()),
                    _ => None,
                }
            }
        }
    };
}

category_dimension! {
    /// Exam type (ETITLE)
    ExamType, "exam_type" {
        InsuranceBroker => 'A', ["보험중개사"],
        InsuranceUnderwriter => 'B', ["보험심사역"],
        ClaimsAdjuster => 'C', ["손해사정사"],
    }
}

category_dimension! {
    /// Exam class (ECLASS)
    ExamClass, "exam_class" {
        LifeInsurance => 'A', ["생명보험"],
        NonLifeInsurance => 'B', ["손해보험"],
        ThirdSector => 'C', ["제3보험"],
    }
}

category_dimension! {
    /// Top-level subject (LAYER1)
    Subject, "subject" {
        RegulatoryLaw => 'A', ["관계법령"],
        NonLifePart1 => 'B', ["손보1부"],
        NonLifePart2 => 'C', ["손보2부"],
    }
}

category_dimension! {
    /// Question kind (QTYPE)
    QuestionKind, "question_kind" {
        MultipleChoice => 'A', ["A", "기출문제(선택형)", "선택형"],
        TrueFalse => 'B', ["B", "진위형"],
    }
}

/// The four parsed category values of one record
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CategoryValues {
    pub exam_type: ExamType,
    pub exam_class: ExamClass,
    pub subject: Subject,
    pub kind: QuestionKind,
}

impl CategoryValues {
    pub fn new(exam_type: ExamType, exam_class: ExamClass, subject: Subject, kind: QuestionKind) -> Self {
        Self {
            exam_type,
            exam_class,
            subject,
            kind,
        }
    }

    /// Parse all four dimensions from raw strings
    pub fn parse(exam_type: &str, exam_class: &str, subject: &str, kind: &str) -> Self {
        Self {
            exam_type: ExamType::parse(exam_type),
            exam_class: ExamClass::parse(exam_class),
            subject: Subject::parse(subject),
            kind: QuestionKind::parse(kind),
        }
    }
}

/// The four code characters of one record, in identifier order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CategoryCodes {
    pub exam: char,
    pub class: char,
    pub subject: char,
    pub kind: char,
}

impl CategoryCodes {
    /// Leading block (exam type + exam class)
    pub fn head(&self) -> String {
        [self.exam, self.class].iter().collect()
    }

    /// Trailing block (subject + kind)
    pub fn tail(&self) -> String {
        [self.subject, self.kind].iter().collect()
    }

    /// True when none of the codes is the sentinel
    pub fn is_fully_mapped(&self) -> bool {
        ![self.exam, self.class, self.subject, self.kind].contains(&SENTINEL_CODE)
    }
}

/// Static lookup from category values to codes
#[derive(Debug, Clone, Copy, Default)]
pub struct CategoryCodeTable;

impl CategoryCodeTable {
    /// Resolve codes for all four dimensions, collecting unmapped values
    pub fn lookup(&self, values: &CategoryValues) -> (CategoryCodes, Vec<UnmappedCategory>) {
        let mut unmapped = Vec::new();
        let codes = CategoryCodes {
            exam: Self::resolve(&values.exam_type, &mut unmapped),
            class: Self::resolve(&values.exam_class, &mut unmapped),
            subject: Self::resolve(&values.subject, &mut unmapped),
            kind: Self::resolve(&values.kind, &mut unmapped),
        };
        (codes, unmapped)
    }

    fn resolve<D: CategoryDimension>(value: &D, unmapped: &mut Vec<UnmappedCategory>) -> char {
        if let Some(raw) = value.unmapped_value() {
            warn!("No code for {} '{}', using '{}'", D::NAME, raw, SENTINEL_CODE);
            unmapped.push(UnmappedCategory {
                dimension: D::NAME.to_string(),
                value: raw.to_string(),
            });
        }
        value.code()
    }
}
