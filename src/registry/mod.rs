//! Canonical registry for heterogeneous vendor identifiers.
//!
//! Raw vendor country/service ids never leave the provider rows. Everything
//! downstream keys on canonical codes (human-readable) and the stable integer
//! ids assigned lazily here. Ids are monotonic and never deleted.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use lazy_static::lazy_static;
use parking_lot::RwLock;

use crate::storage::Storage;

/// Extension preference for locally persisted icons.
pub const ICON_EXT_RANKING: [&str; 4] = ["svg", "webp", "png", "jpg"];

/// A canonicalized country identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalCountry {
    pub code: String,
    pub name: String,
    pub iso2: Option<String>,
}

/// A canonicalized service identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalService {
    pub code: String,
    pub name: String,
}

/// `(iso2, canonical name, aliases)` seed rows for country resolution.
const COUNTRY_TABLE: &[(&str, &str, &[&str])] = &[
    ("us", "United States", &["usa", "united states", "united states of america", "america"]),
    ("gb", "United Kingdom", &["uk", "united kingdom", "great britain", "england"]),
    ("ru", "Russia", &["russia", "russian federation"]),
    ("in", "India", &["india"]),
    ("id", "Indonesia", &["indonesia"]),
    ("cn", "China", &["china"]),
    ("de", "Germany", &["germany"]),
    ("fr", "France", &["france"]),
    ("es", "Spain", &["spain"]),
    ("it", "Italy", &["italy"]),
    ("pt", "Portugal", &["portugal"]),
    ("nl", "Netherlands", &["netherlands", "holland"]),
    ("pl", "Poland", &["poland"]),
    ("ua", "Ukraine", &["ukraine"]),
    ("kz", "Kazakhstan", &["kazakhstan"]),
    ("br", "Brazil", &["brazil"]),
    ("mx", "Mexico", &["mexico"]),
    ("ar", "Argentina", &["argentina"]),
    ("co", "Colombia", &["colombia"]),
    ("ca", "Canada", &["canada"]),
    ("au", "Australia", &["australia"]),
    ("nz", "New Zealand", &["new zealand"]),
    ("jp", "Japan", &["japan"]),
    ("kr", "South Korea", &["south korea", "korea"]),
    ("vn", "Vietnam", &["vietnam", "viet nam"]),
    ("th", "Thailand", &["thailand"]),
    ("ph", "Philippines", &["philippines"]),
    ("my", "Malaysia", &["malaysia"]),
    ("pk", "Pakistan", &["pakistan"]),
    ("bd", "Bangladesh", &["bangladesh"]),
    ("ng", "Nigeria", &["nigeria"]),
    ("ke", "Kenya", &["kenya"]),
    ("za", "South Africa", &["south africa"]),
    ("eg", "Egypt", &["egypt"]),
    ("ma", "Morocco", &["morocco"]),
    ("tr", "Turkey", &["turkey", "turkiye"]),
    ("sa", "Saudi Arabia", &["saudi arabia", "ksa"]),
    ("ae", "United Arab Emirates", &["uae", "united arab emirates", "emirates"]),
    ("il", "Israel", &["israel"]),
    ("ir", "Iran", &["iran"]),
    ("ge", "Georgia", &["georgia"]),
    ("ro", "Romania", &["romania"]),
    ("cz", "Czechia", &["czech republic", "czechia"]),
    ("se", "Sweden", &["sweden"]),
    ("no", "Norway", &["norway"]),
    ("fi", "Finland", &["finland"]),
    ("dk", "Denmark", &["denmark"]),
    ("ee", "Estonia", &["estonia"]),
    ("lv", "Latvia", &["latvia"]),
    ("lt", "Lithuania", &["lithuania"]),
];

/// `(canonical code, display name, aliases)` seed rows for services.
const SERVICE_TABLE: &[(&str, &str, &[&str])] = &[
    ("whatsapp", "WhatsApp", &["wa", "whats app", "whatsap"]),
    ("telegram", "Telegram", &["tg"]),
    ("instagram", "Instagram", &["ig", "insta"]),
    ("facebook", "Facebook", &["fb"]),
    ("google", "Google", &["go", "gmail", "youtube"]),
    ("twitter", "Twitter / X", &["tw", "x"]),
    ("viber", "Viber", &["vi"]),
    ("vkontakte", "VKontakte", &["vk"]),
    ("odnoklassniki", "Odnoklassniki", &["ok"]),
    ("microsoft", "Microsoft", &["mm", "outlook", "hotmail"]),
    ("amazon", "Amazon", &["am"]),
    ("apple", "Apple", &["wx_apple", "icloud"]),
    ("discord", "Discord", &["ds"]),
    ("tiktok", "TikTok", &["lf", "tik tok", "tiktok douyin"]),
    ("snapchat", "Snapchat", &["fu"]),
    ("uber", "Uber", &["ub"]),
    ("netflix", "Netflix", &["nf"]),
    ("openai", "OpenAI / ChatGPT", &["dr", "chatgpt"]),
    ("steam", "Steam", &["mt"]),
    ("yandex", "Yandex", &["ya"]),
    ("avito", "Avito", &["av"]),
    ("wechat", "WeChat", &["wb"]),
    ("line", "LINE", &["me"]),
    ("paypal", "PayPal", &["ts"]),
    ("linkedin", "LinkedIn", &["tn"]),
];

lazy_static! {
    static ref COUNTRY_ALIASES: HashMap<&'static str, (&'static str, &'static str)> = {
        let mut m = HashMap::new();
        for (iso2, name, aliases) in COUNTRY_TABLE {
            m.insert(*iso2, (*iso2, *name));
            for alias in *aliases {
                m.insert(*alias, (*iso2, *name));
            }
        }
        m
    };
    static ref ISO2_NAMES: HashMap<&'static str, &'static str> = {
        COUNTRY_TABLE.iter().map(|(iso2, name, _)| (*iso2, *name)).collect()
    };
    static ref SERVICE_ALIASES: HashMap<&'static str, (&'static str, &'static str)> = {
        let mut m = HashMap::new();
        for (code, name, aliases) in SERVICE_TABLE {
            m.insert(*code, (*code, *name));
            for alias in *aliases {
                m.insert(*alias, (*code, *name));
            }
        }
        m
    };
}

/// Lowercase, collapse anything outside `[a-z0-9]` into single underscores.
pub fn slugify(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_sep = true;
    for c in raw.trim().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

fn title_case(raw: &str) -> String {
    raw.trim()
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// A stored name that carries no information beyond its external id. Rows
/// with placeholder names force a metadata re-fetch regardless of freshness.
pub fn is_placeholder_name(name: &str, external_id: &str) -> bool {
    let trimmed = name.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case(external_id)
        || trimmed.chars().all(|c| c.is_ascii_digit())
}

pub struct CanonicalRegistry {
    storage: Arc<Storage>,
    icon_dir: PathBuf,
    country_ids: RwLock<HashMap<String, i64>>,
    service_ids: RwLock<HashMap<String, i64>>,
}

impl CanonicalRegistry {
    pub fn new(storage: Arc<Storage>, icon_dir: PathBuf) -> Self {
        Self {
            storage,
            icon_dir,
            country_ids: RwLock::new(HashMap::new()),
            service_ids: RwLock::new(HashMap::new()),
        }
    }

    /// Canonicalize a raw country name or code.
    pub fn canonical_country(&self, raw: &str) -> CanonicalCountry {
        let trimmed = raw.trim();
        let lowered = trimmed.to_lowercase();

        if let Some((iso2, name)) = COUNTRY_ALIASES.get(lowered.as_str()) {
            return CanonicalCountry {
                code: (*iso2).to_string(),
                name: (*name).to_string(),
                iso2: Some((*iso2).to_string()),
            };
        }
        // A bare two-letter code we have no row for is still usable as-is.
        if lowered.len() == 2 && lowered.chars().all(|c| c.is_ascii_lowercase()) {
            return CanonicalCountry {
                code: lowered.clone(),
                name: ISO2_NAMES
                    .get(lowered.as_str())
                    .map(|n| (*n).to_string())
                    .unwrap_or_else(|| lowered.to_uppercase()),
                iso2: Some(lowered),
            };
        }
        CanonicalCountry {
            code: slugify(trimmed),
            name: title_case(trimmed),
            iso2: None,
        }
    }

    /// Canonicalize a raw service name or code, applying display overrides.
    pub fn canonical_service(&self, raw: &str) -> CanonicalService {
        let key = slugify(raw);
        if let Some((code, name)) = SERVICE_ALIASES.get(key.as_str()) {
            return CanonicalService {
                code: (*code).to_string(),
                name: (*name).to_string(),
            };
        }
        CanonicalService {
            name: title_case(raw),
            code: key,
        }
    }

    /// Stable integer id for a canonical country code, assigned on first use.
    pub fn country_id(&self, code: &str, name: &str) -> Result<i64> {
        if let Some(id) = self.country_ids.read().get(code) {
            return Ok(*id);
        }
        let id = self.storage.get_or_create_country_lookup(code, name)?;
        self.country_ids.write().insert(code.to_string(), id);
        Ok(id)
    }

    /// Stable integer id for a canonical service code, assigned on first use.
    pub fn service_id(&self, code: &str, name: &str) -> Result<i64> {
        if let Some(id) = self.service_ids.read().get(code) {
            return Ok(*id);
        }
        let id = self.storage.get_or_create_service_lookup(code, name)?;
        self.service_ids.write().insert(code.to_string(), id);
        Ok(id)
    }

    /// Icon resolution order: local persisted asset, vendor URL, deterministic
    /// placeholder derived from the canonical slug.
    pub fn resolve_icon(&self, slug: &str, vendor_url: Option<String>) -> Option<String> {
        for ext in ICON_EXT_RANKING {
            let path = self.icon_dir.join(format!("{}.{}", slug, ext));
            if path.exists() {
                return Some(format!("/icons/{}.{}", slug, ext));
            }
        }
        vendor_url
            .filter(|u| !u.trim().is_empty())
            .or_else(|| Some(placeholder_icon(slug)))
    }

}

/// Deterministic placeholder icon URL for a canonical slug.
pub fn placeholder_icon(slug: &str) -> String {
    let seed: String = slug
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    format!("https://ui-avatars.com/api/?name={}&format=svg", seed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::storage_fixture;
    use std::path::Path;

    fn registry() -> CanonicalRegistry {
        CanonicalRegistry::new(storage_fixture(), Path::new("/nonexistent").to_path_buf())
    }

    #[test]
    fn country_aliases_resolve_to_iso2() {
        let r = registry();
        for raw in ["USA", "United States", "us", " america "] {
            let c = r.canonical_country(raw);
            assert_eq!(c.code, "us");
            assert_eq!(c.name, "United States");
            assert_eq!(c.iso2.as_deref(), Some("us"));
        }
    }

    #[test]
    fn unknown_country_falls_back_to_slug() {
        let r = registry();
        let c = r.canonical_country("Atlantis Republic");
        assert_eq!(c.code, "atlantis_republic");
        assert_eq!(c.name, "Atlantis Republic");
        assert!(c.iso2.is_none());
    }

    #[test]
    fn bare_iso2_passes_through() {
        let r = registry();
        let c = r.canonical_country("ge");
        assert_eq!(c.code, "ge");
        assert_eq!(c.name, "Georgia");
    }

    #[test]
    fn service_aliases_and_overrides() {
        let r = registry();
        assert_eq!(r.canonical_service("wa").code, "whatsapp");
        assert_eq!(r.canonical_service("wa").name, "WhatsApp");
        assert_eq!(r.canonical_service("Tik Tok").code, "tiktok");
        assert_eq!(r.canonical_service("My Custom App").code, "my_custom_app");
        assert_eq!(r.canonical_service("My Custom App").name, "My Custom App");
    }

    #[test]
    fn ids_are_stable_and_monotonic() {
        let r = registry();
        let us = r.country_id("us", "United States").unwrap();
        let ru = r.country_id("ru", "Russia").unwrap();
        assert_ne!(us, ru);
        assert_eq!(r.country_id("us", "United States").unwrap(), us);

        let wa = r.service_id("whatsapp", "WhatsApp").unwrap();
        assert_eq!(r.service_id("whatsapp", "WhatsApp").unwrap(), wa);
    }

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("  Tik -- Tok! "), "tik_tok");
        assert_eq!(slugify("a.b.c"), "a_b_c");
        assert_eq!(slugify("ABC"), "abc");
    }

    #[test]
    fn placeholder_names_detected() {
        assert!(is_placeholder_name("", "12"));
        assert!(is_placeholder_name("12", "12"));
        assert!(is_placeholder_name("187", "x"));
        assert!(!is_placeholder_name("Russia", "0"));
    }

    #[test]
    fn icon_falls_back_to_vendor_then_placeholder() {
        let r = registry();
        assert_eq!(
            r.resolve_icon("whatsapp", Some("https://cdn.vendor/wa.png".into())),
            Some("https://cdn.vendor/wa.png".into())
        );
        let placeholder = r.resolve_icon("whatsapp", None).unwrap();
        assert!(placeholder.contains("whatsapp"));
    }
}
