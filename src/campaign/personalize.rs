//! Template personalization.

use regex::Regex;

use crate::directory::Contact;

/// Single-segment limit for GSM-7 text.
pub const GSM_LIMIT: usize = 160;

/// Single-segment limit for UCS-2 text.
pub const UNICODE_LIMIT: usize = 70;

/// Appended when a message is cut.
pub const TRUNCATION_MARKER: &str = "...";

/// Greeting used when no usable first name exists.
pub const DEFAULT_FIRST_NAME: &str = "there";

/// GSM 03.38 basic character set.
const GSM_BASIC: &str = "@£$¥èéùìòÇ\nØø\rÅåΔ_ΦΓΛΩΠΨΣΘΞÆæßÉ !\"#¤%&'()*+,-./0123456789:;<=>?\
¡ABCDEFGHIJKLMNOPQRSTUVWXYZÄÖÑÜ§¿abcdefghijklmnopqrstuvwxyzäöñüà";

/// GSM 03.38 extension table (two septets each).
const GSM_EXTENDED: &str = "^{}\\[~]|€\u{000C}";

/// Message encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Gsm7,
    Ucs2,
}

impl Encoding {
    pub fn limit(&self) -> usize {
        match self {
            Self::Gsm7 => GSM_LIMIT,
            Self::Ucs2 => UNICODE_LIMIT,
        }
    }

    /// Length of one character in this encoding's units.
    fn units(&self, c: char) -> usize {
        match self {
            Self::Gsm7 if GSM_EXTENDED.contains(c) => 2,
            Self::Gsm7 => 1,
            Self::Ucs2 => c.len_utf16(),
        }
    }

    fn length(&self, text: &str) -> usize {
        text.chars().map(|c| self.units(c)).sum()
    }

    /// Pick the encoding a message needs.
    pub fn detect(text: &str) -> Self {
        if text
            .chars()
            .all(|c| GSM_BASIC.contains(c) || GSM_EXTENDED.contains(c))
        {
            Self::Gsm7
        } else {
            Self::Ucs2
        }
    }
}

/// Rendered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub text: String,
    pub encoding: Encoding,
    pub truncated: bool,
}

/// Substitutes `{token}` placeholders with contact attributes.
#[derive(Debug, Clone)]
pub struct Personalizer {
    token: Regex,
    leftover: Regex,
    spaces: Regex,
    space_before_punct: Regex,
    phone_like: Regex,
    id_like: Regex,
}

impl Personalizer {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            token: Regex::new(r"\{\s*([A-Za-z0-9_]+)\s*\}")?,
            leftover: Regex::new(r"\{[^{}]*\}")?,
            spaces: Regex::new(r"[ \t]{2,}")?,
            space_before_punct: Regex::new(r"[ \t]+([,.!?;:])")?,
            phone_like: Regex::new(r"^\+?[\d\s().\-]{7,}$")?,
            // UUIDs, prefixed hex/numeric IDs (ct_000123, SM9f8e...), long hex, bare numbers
            id_like: Regex::new(
                r"(?i)^(?:[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}|[a-z]{1,4}[_\-]?[0-9a-f]{6,}|[0-9a-f]{16,}|\d+)$",
            )?,
        })
    }

    /// Render a template for a contact.
    pub fn render(&self, template: &str, contact: &Contact) -> Rendered {
        let substituted = self.token.replace_all(template, |caps: &regex::Captures<'_>| {
            self.resolve(&caps[1], contact).unwrap_or_else(|| caps[0].to_string())
        });

        let stripped = self.leftover.replace_all(&substituted, "");
        let collapsed = self.spaces.replace_all(&stripped, " ");
        let tidy = self.space_before_punct.replace_all(&collapsed, "$1");

        truncate(tidy.trim())
    }

    /// Value for a known token; None leaves the token for stripping.
    fn resolve(&self, token: &str, contact: &Contact) -> Option<String> {
        let value = |v: &Option<String>| clean(v.as_deref()).unwrap_or_default();
        let resolved = match token {
            "first_name" => self.first_name(contact),
            "last_name" => value(&contact.last_name),
            "company" => value(&contact.company),
            "property_address" => value(&contact.property_address),
            "city" => value(&contact.city),
            "custom1" => value(&contact.custom1),
            "custom2" => value(&contact.custom2),
            _ => return None,
        };
        Some(resolved)
    }

    fn first_name(&self, contact: &Contact) -> String {
        match clean(contact.first_name.as_deref()) {
            Some(name) if !self.phone_like.is_match(&name) && !self.id_like.is_match(&name) => name,
            _ => DEFAULT_FIRST_NAME.to_string(),
        }
    }
}

/// Trim, and treat empty or placeholder-ish values as missing.
fn clean(value: Option<&str>) -> Option<String> {
    let v = value?.trim();
    if v.is_empty() || ["none", "null", "undefined", "nan"].contains(&v.to_ascii_lowercase().as_str()) {
        return None;
    }
    Some(v.to_string())
}

/// Cut to the encoding's single-segment limit, appending the marker.
fn truncate(text: &str) -> Rendered {
    let encoding = Encoding::detect(text);
    let limit = encoding.limit();

    if encoding.length(text) <= limit {
        return Rendered {
            text: text.to_string(),
            encoding,
            truncated: false,
        };
    }

    let budget = limit - encoding.length(TRUNCATION_MARKER);
    let mut used = 0;
    let mut cut = String::new();
    for c in text.chars() {
        let n = encoding.units(c);
        if used + n > budget {
            break;
        }
        used += n;
        cut.push(c);
    }

    let mut out = cut.trim_end().to_string();
    out.push_str(TRUNCATION_MARKER);
    Rendered {
        text: out,
        encoding,
        truncated: true,
    }
}
