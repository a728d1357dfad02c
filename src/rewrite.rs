//! Prefix rewriting for proxied HTML bodies.
//!
//! Workers render pages as if they were served from their own origin, so
//! root-relative references (`href="/..."`, `src="/..."`, CSS `url(/...)`)
//! would escape the gateway's routing prefix. This module prefixes those
//! references with a fixed set of text substitutions.
//!
//! This is deliberately a best-effort text transform, not an HTML or CSS
//! parser: a literal `href="/` inside unrelated text will be rewritten too.
//! Known limitation, accepted for simplicity. Each occurrence is rewritten
//! at most once — text already carrying the prefix is left alone, so the
//! transform is idempotent.

/// Attribute/function leads whose next character decides whether a
/// root-relative reference follows
const LEADS: [&str; 9] = [
    "href=\"", "href='", "src=\"", "src='", "action=\"", "action='", "url(", "url(\"", "url('",
];

pub struct HtmlRewriter {
    prefix: String,
    /// Replacement for the `location.origin` JS literal, quoted
    origin_literal: String,
}

impl HtmlRewriter {
    pub fn new(prefix: &str, public_origin: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            origin_literal: format!("'{}{}'", public_origin, prefix),
        }
    }

    /// Rewrite one HTML body
    pub fn rewrite(&self, body: &str) -> String {
        let mut out = body.to_string();
        for lead in LEADS {
            out = self.apply_lead(&out, lead);
        }
        // Scripts that compute URLs from the page origin need the prefix too
        out.replace("location.origin", &self.origin_literal)
    }

    /// Prefix every `<lead>/...` occurrence that is not already prefixed
    fn apply_lead(&self, body: &str, lead: &str) -> String {
        let mut out = String::with_capacity(body.len() + 64);
        let mut rest = body;
        while let Some(idx) = rest.find(lead) {
            let after = idx + lead.len();
            out.push_str(&rest[..after]);
            let tail = &rest[after..];
            if tail.starts_with('/') && !self.already_prefixed(tail) {
                out.push_str(&self.prefix);
            }
            rest = tail;
        }
        out.push_str(rest);
        out
    }

    /// Whether a reference already starts with the routing prefix as a
    /// whole path segment (so `/workspace-old/...` is still rewritten)
    fn already_prefixed(&self, reference: &str) -> bool {
        if !reference.starts_with(&self.prefix) {
            return false;
        }
        matches!(
            reference.as_bytes().get(self.prefix.len()),
            None | Some(b'/') | Some(b'"') | Some(b'\'') | Some(b')') | Some(b'?') | Some(b'#')
        )
    }
}
