//! Echo translator for testing.
//!
//! Returns `[<target>] <text>`, which makes it easy to see in the output
//! images which bubbles were "translated".

use crate::prelude::*;

use super::{LanguagePair, Translator};

/// Echo translator for testing.
pub struct EchoTranslator {
    target: String,
}

impl EchoTranslator {
    pub fn new(pair: &LanguagePair) -> Self {
        Self {
            target: pair.target.clone(),
        }
    }
}

#[async_trait]
impl Translator for EchoTranslator {
    async fn translate(&self, text: &str) -> Result<String> {
        Ok(format!("[{}] {}", self.target, text))
    }
}
