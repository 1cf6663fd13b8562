//! # Language Code Resolution
//!
//! Maps client-supplied language codes onto the regional locale codes the
//! speech service accepts. Resolution is strict: an exact supported code
//! passes through, a bare base code ("ar", "en") maps to a documented
//! regional default, and anything else is rejected so the client hears about
//! the problem instead of silently transcribing the wrong language.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

/// Cached lookup set built from `SUPPORTED` on first use
static SUPPORTED_SET: OnceLock<HashSet<&'static str>> = OnceLock::new();

/// Cached base-code map built from `BASE_FALLBACKS` on first use
static FALLBACK_MAP: OnceLock<HashMap<&'static str, &'static str>> = OnceLock::new();

/// Regional locale codes the speech service accepts for streaming recognition.
const SUPPORTED: &[&str] = &[
    // Arabic variants
    "ar-SA", "ar-EG", "ar-AE", "ar-BH", "ar-DZ", "ar-IQ", "ar-JO", "ar-KW", "ar-LB", "ar-LY",
    "ar-MA", "ar-OM", "ar-PS", "ar-QA", "ar-SY", "ar-TN", "ar-YE",
    // English variants
    "en-US", "en-GB", "en-AU", "en-CA", "en-IN", "en-IE", "en-NZ", "en-ZA",
    // European languages
    "es-ES", "es-MX", "es-AR", "fr-FR", "fr-CA", "de-DE", "de-AT", "de-CH", "it-IT", "pt-PT",
    "pt-BR", "ru-RU", "nl-NL", "nl-BE", "sv-SE", "da-DK", "nb-NO", "fi-FI", "pl-PL", "cs-CZ",
    "hu-HU", "ro-RO", "bg-BG", "hr-HR", "sk-SK", "sl-SI", "et-EE", "lv-LV", "lt-LT", "mt-MT",
    "el-GR", "uk-UA", "ca-ES",
    // Middle Eastern and Asian languages
    "he-IL", "tr-TR", "fa-IR", "hi-IN", "ur-PK", "bn-IN", "ta-IN", "te-IN", "mr-IN", "gu-IN",
    "kn-IN", "ml-IN", "ja-JP", "ko-KR", "zh-CN", "zh-TW", "zh-HK", "th-TH", "vi-VN", "id-ID",
    "ms-MY", "fil-PH",
    // African languages
    "sw-KE", "am-ET", "yo-NG", "zu-ZA",
];

/// Regional defaults for bare two-letter codes.
///
/// A client asking for "ar" gets Saudi Arabic, "en" gets US English, and so
/// on. These match what the capture clients historically expected.
const BASE_FALLBACKS: &[(&str, &str)] = &[
    ("en", "en-US"),
    ("ar", "ar-SA"),
    ("es", "es-ES"),
    ("fr", "fr-FR"),
    ("de", "de-DE"),
    ("it", "it-IT"),
    ("pt", "pt-PT"),
    ("ru", "ru-RU"),
    ("ja", "ja-JP"),
    ("ko", "ko-KR"),
    ("zh", "zh-CN"),
    ("hi", "hi-IN"),
    ("tr", "tr-TR"),
    ("nl", "nl-NL"),
    ("sv", "sv-SE"),
    ("da", "da-DK"),
    ("no", "nb-NO"),
    ("fi", "fi-FI"),
    ("pl", "pl-PL"),
    ("cs", "cs-CZ"),
    ("hu", "hu-HU"),
    ("ro", "ro-RO"),
    ("bg", "bg-BG"),
    ("hr", "hr-HR"),
    ("sk", "sk-SK"),
    ("sl", "sl-SI"),
    ("et", "et-EE"),
    ("lv", "lv-LV"),
    ("lt", "lt-LT"),
    ("mt", "mt-MT"),
    ("el", "el-GR"),
    ("he", "he-IL"),
    ("th", "th-TH"),
    ("vi", "vi-VN"),
    ("id", "id-ID"),
    ("ms", "ms-MY"),
    ("tl", "fil-PH"),
    ("sw", "sw-KE"),
    ("am", "am-ET"),
    ("yo", "yo-NG"),
    ("zu", "zu-ZA"),
];

/// Candidate languages offered to the service when the client requests
/// automatic detection. The service caps continuous language identification
/// at ten candidates, so this list must not grow past that.
const AUTO_DETECT_CANDIDATES: &[&str] = &[
    "en-US", "ar-SA", "es-ES", "fr-FR", "de-DE", "it-IT", "pt-PT", "ru-RU", "zh-CN", "ja-JP",
];

fn supported_set() -> &'static HashSet<&'static str> {
    SUPPORTED_SET.get_or_init(|| SUPPORTED.iter().copied().collect())
}

fn fallback_map() -> &'static HashMap<&'static str, &'static str> {
    FALLBACK_MAP.get_or_init(|| BASE_FALLBACKS.iter().copied().collect())
}

/// Resolves a client-supplied language code to a supported regional code.
///
/// Tries an exact match first, then the base-code fallback table. Returns
/// `None` for anything unresolvable; callers turn that into a session error
/// rather than substituting a default.
pub fn resolve(code: &str) -> Option<&'static str> {
    let trimmed = code.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Some(exact) = supported_set().get(trimmed) {
        return Some(exact);
    }

    let base = trimmed
        .split(['-', '_'])
        .next()
        .unwrap_or(trimmed)
        .to_lowercase();
    fallback_map().get(base.as_str()).copied()
}

/// True when the code resolves to a supported locale.
pub fn is_supported(code: &str) -> bool {
    resolve(code).is_some()
}

/// Candidate list for automatic language identification.
pub fn auto_detect_candidates() -> &'static [&'static str] {
    AUTO_DETECT_CANDIDATES
}

/// Every locale code accepted for streaming recognition.
pub fn supported_languages() -> &'static [&'static str] {
    SUPPORTED
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert_eq!(resolve("ar-SA"), Some("ar-SA"));
        assert_eq!(resolve("en-GB"), Some("en-GB"));
        assert_eq!(resolve("fil-PH"), Some("fil-PH"));
    }

    #[test]
    fn test_base_code_fallback() {
        assert_eq!(resolve("ar"), Some("ar-SA"));
        assert_eq!(resolve("en"), Some("en-US"));
        assert_eq!(resolve("no"), Some("nb-NO"));
        assert_eq!(resolve("tl"), Some("fil-PH"));
    }

    #[test]
    fn test_unknown_region_falls_back_to_base() {
        // A plausible but unsupported regional variant still lands on the
        // base-language default instead of being rejected outright.
        assert_eq!(resolve("en-XX"), Some("en-US"));
        assert_eq!(resolve("ar_001"), Some("ar-SA"));
    }

    #[test]
    fn test_unresolvable_codes_rejected() {
        assert_eq!(resolve("xx-YY"), None);
        assert_eq!(resolve("klingon"), None);
        assert_eq!(resolve(""), None);
        assert_eq!(resolve("   "), None);
        assert!(!is_supported("xx-YY"));
    }

    #[test]
    fn test_auto_detect_candidates_within_service_cap() {
        assert!(auto_detect_candidates().len() <= 10);
        for code in auto_detect_candidates() {
            assert!(is_supported(code), "candidate {} must be supported", code);
        }
    }

    #[test]
    fn test_fallback_targets_are_supported() {
        for (base, target) in BASE_FALLBACKS {
            assert!(
                supported_set().contains(target),
                "fallback {} -> {} must point at a supported locale",
                base,
                target
            );
        }
    }
}
