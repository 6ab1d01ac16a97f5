//! Final-text cleanup.
//!
//! Models echo prompt scaffolding back at us: reply prefixes copied from the
//! history format, the tag marking the message being answered, and platform
//! emoji shortcodes.  These are stripped before emotion placeholders such as
//! `<happy>` are swapped for the configured presentation tokens.

use std::collections::BTreeMap;

use regex::{Captures, Regex};

use crate::error::{EngineError, Result};

const REPLY_PREFIX: &str = r"(?i)^\s*[\[［【(（]\s*(?:reply|回复)\s*@[^\]］】)）]*[\]］】)）]\s*";
const CURRENT_MESSAGE_TAG: &str = r"(?i)</?CURRENT_USER_MESSAGE_TO_REPLY[^>]*>";
const SHORTCODE: &str = r":\w+:";
const PLACEHOLDER: &str = r"<([^<>\s/:@#]{1,24})>";

/// Compiled cleanup patterns plus the emotion table.
#[derive(Debug, Clone)]
pub struct PostProcessor {
    reply_prefix: Regex,
    current_message_tag: Regex,
    shortcode: Regex,
    placeholder: Regex,
    emotions: BTreeMap<String, String>,
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| EngineError::Internal(format!("invalid pattern `{pattern}`: {e}")))
}

impl PostProcessor {
    pub fn new(emotions: BTreeMap<String, String>) -> Result<Self> {
        Ok(Self {
            reply_prefix: compile(REPLY_PREFIX)?,
            current_message_tag: compile(CURRENT_MESSAGE_TAG)?,
            shortcode: compile(SHORTCODE)?,
            placeholder: compile(PLACEHOLDER)?,
            emotions,
        })
    }

    /// Clean a final model answer and map its emotion placeholders.
    ///
    /// Placeholders missing from the emotion table are left untouched.
    pub fn apply(&self, raw: &str) -> String {
        let text = self.reply_prefix.replace(raw, "");
        let text = self.current_message_tag.replace_all(&text, "");
        let text = self.shortcode.replace_all(&text, "");
        let text = self.placeholder.replace_all(&text, |caps: &Captures<'_>| {
            self.emotions
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_owned())
        });
        text.trim().to_owned()
    }
}
