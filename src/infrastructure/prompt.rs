//! Answering the unknown-version question
//!
//! [`SelectorConversionPrompt`] asks interactively through a [`Selector`];
//! [`FixedConversionPrompt`] answers from a command-line flag.

use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::application::services::{ConversionChoice, ConversionPrompt};
use crate::application::{ApplicationError, ApplicationResult};
use crate::domain::VersionClass;
use crate::infrastructure::traits::{SelectionItem, Selector};

const CONVERT: &str = "convert";
const CONVERT_ALWAYS: &str = "convert-always";
const AS_IS: &str = "as-is";
const AS_IS_ALWAYS: &str = "as-is-always";

/// Prompt backed by an interactive selector.
pub struct SelectorConversionPrompt {
    selector: Arc<dyn Selector>,
}

impl SelectorConversionPrompt {
    pub fn new(selector: Arc<dyn Selector>) -> Self {
        Self { selector }
    }

    fn items() -> Vec<SelectionItem> {
        [
            (CONVERT, "Convert to the current format"),
            (CONVERT_ALWAYS, "Convert, and don't ask again"),
            (AS_IS, "Open as-is (best effort)"),
            (AS_IS_ALWAYS, "Open as-is, and don't ask again"),
        ]
        .into_iter()
        .map(|(value, display)| SelectionItem {
            display: display.to_string(),
            value: value.to_string(),
        })
        .collect()
    }

    fn choice_for(value: &str) -> Option<ConversionChoice> {
        let (convert, remember) = match value {
            CONVERT => (true, false),
            CONVERT_ALWAYS => (true, true),
            AS_IS => (false, false),
            AS_IS_ALWAYS => (false, true),
            _ => return None,
        };
        Some(ConversionChoice { convert, remember })
    }
}

impl ConversionPrompt for SelectorConversionPrompt {
    fn ask(&self, file: &Path, class: &VersionClass) -> ApplicationResult<Option<ConversionChoice>> {
        let prompt = format!("{} is {}> ", file.display(), class);
        let selected = self
            .selector
            .select_one(&Self::items(), &prompt)
            .map_err(|e| ApplicationError::OperationFailed {
                context: "ask for conversion".to_string(),
                source: e.into(),
            })?;
        debug!("ask: selected {:?}", selected);
        Ok(selected.and_then(|item| Self::choice_for(&item.value)))
    }
}

/// Prompt that always gives the same answer without remembering it.
#[derive(Debug, Clone, Copy)]
pub struct FixedConversionPrompt {
    convert: bool,
}

impl FixedConversionPrompt {
    pub fn new(convert: bool) -> Self {
        Self { convert }
    }
}

impl ConversionPrompt for FixedConversionPrompt {
    fn ask(&self, _file: &Path, _class: &VersionClass) -> ApplicationResult<Option<ConversionChoice>> {
        Ok(Some(ConversionChoice {
            convert: self.convert,
            remember: false,
        }))
    }
}
