//! Per-request session settings.

use serde::{Deserialize, Serialize};

/// Settings supplied by the caller for one planning request.
///
/// `catalog` and `schema` override the manifest's implicit qualifying
/// prefix; empty strings mean "use the manifest's own". The
/// `enable_dynamic_fields` flag selects between narrow CTEs (only the
/// columns a statement needs) and full materialization of every column of
/// every referenced object. The flag is read per request; there is no
/// mid-session state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionContext {
    pub catalog: String,
    pub schema: String,
    pub enable_dynamic_fields: bool,
}

impl Default for SessionContext {
    fn default() -> Self {
        SessionContext {
            catalog: String::new(),
            schema: String::new(),
            enable_dynamic_fields: true,
        }
    }
}

impl SessionContext {
    pub fn new(catalog: impl Into<String>, schema: impl Into<String>) -> Self {
        SessionContext {
            catalog: catalog.into(),
            schema: schema.into(),
            enable_dynamic_fields: true,
        }
    }

    /// Disable dynamic fields: every column of every referenced object is
    /// projected into its CTE.
    pub fn with_full_materialization(mut self) -> Self {
        self.enable_dynamic_fields = false;
        self
    }
}
