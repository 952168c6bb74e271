//! Minimal prompt rendering from a layered context.
//!
//! Tiers are rendered in order under fixed section headers. Richer templates
//! belong to the caller; this is enough to drive an OpenAI-compatible chat
//! endpoint.

use std::fmt::Write;

use serde::{Deserialize, Serialize};

use crate::context::{ContextItem, LayeredContext, Tier};

const SYSTEM_PROMPT: &str = "You are a novelist drafting one unit of a longer work. \
Stay consistent with the story bible and the established continuity. \
Reply with the prose of the unit only, no headings or commentary.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedPrompt {
    pub system: String,
    pub user: String,
}

#[must_use]
pub fn render_prompt(context: &LayeredContext) -> RenderedPrompt {
    let mut user = String::new();
    for (tier, header) in [
        (Tier::Required, "Story bible"),
        (Tier::Important, "Continuity"),
        (Tier::Reference, "Background"),
    ] {
        render_section(&mut user, header, context.tier(tier));
    }
    let _ = write!(
        user,
        "## Task\nWrite unit {} following its outline entry above.",
        context.unit.ordinal
    );
    RenderedPrompt {
        system: SYSTEM_PROMPT.to_string(),
        user,
    }
}

fn render_section(out: &mut String, header: &str, items: &[ContextItem]) {
    if items.is_empty() {
        return;
    }
    let _ = writeln!(out, "## {header}");
    for item in items {
        let _ = writeln!(out, "### {}", item.label);
        out.push_str(item.text.trim_end());
        if item.truncated {
            out.push_str(" …");
        }
        out.push_str("\n\n");
    }
}
