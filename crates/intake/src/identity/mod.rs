pub mod resolver;

pub use resolver::{
    ancestors, normalize_student_id, Classification, Confidence, IdentityResolver, NamingRule,
};
