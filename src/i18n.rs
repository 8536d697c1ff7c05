/*
Simple i18n helper for the backend.

This module provides:
- A tiny embedded translations store for VI/EN (compile-time embedded JSON).
- A simple `tr` function to lookup translations by key + optional params.
- A `t` convenience wrapper using the default language (DEFAULT_LANG).

Usage:
    use crate::i18n;
    let msg = i18n::t("permission.denied");
    let msg_with = i18n::tr(None, "reminder.single.title", Some(&[("title", "Họp nhóm")]));

Notes:
- Placeholders in translation strings use single-brace format: `{name}`.
- Default language is `vi`. If a key is missing for the requested language,
  the fallback language will be used.
*/

use std::collections::HashMap;
use std::sync::OnceLock;

pub const DEFAULT_LANG: &str = "vi";

static TRANSLATIONS: OnceLock<HashMap<String, HashMap<String, String>>> = OnceLock::new();

const VI_JSON: &str = r#"
{
  "app.name": "Lịch Âm",
  "reminder.single.title": "Sự kiện hôm nay: {title}",
  "reminder.single.body": "Sự kiện {title} diễn ra hôm nay",
  "reminder.multiple.title": "Bạn có {count} sự kiện hôm nay",
  "reminder.multiple.body": "Có {count} sự kiện đang chờ bạn: {titles}",
  "daily.title": "Thông báo hàng ngày",
  "daily.body": "Hãy kiểm tra sự kiện hôm nay trong lịch âm của bạn!",
  "test.title": "Test Notification",
  "test.body": "Đây là thông báo test từ hệ thống",
  "push.default_title": "Lịch Âm",
  "push.default_body": "Bạn có sự kiện mới",
  "worker.action.open": "Mở ứng dụng",
  "worker.action.dismiss": "Bỏ qua",
  "permission.unsupported": "Browser không hỗ trợ thông báo",
  "permission.insecure_context": "Cần HTTPS cho thông báo. Vui lòng sử dụng HTTPS hoặc localhost",
  "permission.denied": "Bạn đã từ chối thông báo",
  "permission.dismissed": "Bạn đã hủy yêu cầu thông báo",
  "register.worker_install_failed": "Không thể đăng ký service worker: {err}",
  "register.worker_activation_timeout": "Service worker không kích hoạt kịp thời",
  "register.invalid_credential": "Khóa thông báo đẩy không hợp lệ",
  "register.token_failed": "Không thể lấy token thông báo: {err}",
  "register.store_failed": "Không thể lưu token thông báo: {err}"
}
"#;

const EN_JSON: &str = r#"
{
  "app.name": "Lunar Calendar",
  "reminder.single.title": "Today's event: {title}",
  "reminder.single.body": "The event {title} takes place today",
  "reminder.multiple.title": "You have {count} events today",
  "reminder.multiple.body": "{count} events are waiting for you: {titles}",
  "daily.title": "Daily reminder",
  "daily.body": "Check today's events in your lunar calendar!",
  "test.title": "Test Notification",
  "test.body": "This is a test notification from the system",
  "push.default_title": "Lunar Calendar",
  "push.default_body": "You have a new event",
  "worker.action.open": "Open app",
  "worker.action.dismiss": "Dismiss",
  "permission.unsupported": "This browser does not support notifications",
  "permission.insecure_context": "Notifications require HTTPS. Please use HTTPS or localhost",
  "permission.denied": "You have declined notifications",
  "permission.dismissed": "You dismissed the notification prompt",
  "register.worker_install_failed": "Failed to register the service worker: {err}",
  "register.worker_activation_timeout": "The service worker did not activate in time",
  "register.invalid_credential": "The push credential is invalid",
  "register.token_failed": "Failed to acquire a push token: {err}",
  "register.store_failed": "Failed to save the push token: {err}"
}
"#;

/// Initialize translations map (lazy).
fn build_translations() -> HashMap<String, HashMap<String, String>> {
    let mut out: HashMap<String, HashMap<String, String>> = HashMap::new();

    // Parse VI
    let vi_map: HashMap<String, String> = serde_json::from_str(VI_JSON).unwrap_or_else(|e| {
        panic!("failed to parse VI_JSON in i18n module: {}", e);
    });
    out.insert("vi".to_string(), vi_map);

    // Parse EN
    let en_map: HashMap<String, String> = serde_json::from_str(EN_JSON).unwrap_or_else(|e| {
        panic!("failed to parse EN_JSON in i18n module: {}", e);
    });
    out.insert("en".to_string(), en_map);

    out
}

/// Returns the global translations map (lang -> (key -> message)).
fn translations() -> &'static HashMap<String, HashMap<String, String>> {
    TRANSLATIONS.get_or_init(build_translations)
}

/// Normalize a language tag into a short, lowercase code (e.g. "vi-VN" -> "vi").
///
/// This is useful when accepting language values from external sources (browser
/// `navigator.language`, query params, etc.) and wanting to convert them to
/// the canonical short form used by our translations keys.
pub fn normalize_language(lang: &str) -> String {
    lang.split('-').next().unwrap_or(lang).to_lowercase()
}

/// Returns true if the given language code is supported by the backend i18n
/// translations (e.g. "vi", "en").
pub fn is_supported_language(lang: &str) -> bool {
    translations().contains_key(lang)
}

/// Translate a key using an explicit language (or default if None).
///
/// - `lang`: optional language code (`"vi"`, `"en"`, ...). If None, DEFAULT_LANG is used.
/// - `key`: translation key (flat string, e.g. "permission.denied").
/// - `params`: optional slice of (name, value) for placeholder replacement. Replacements use single-brace placeholders `{name}`.
///
/// Returns the translated and parameter-substituted string. If no translation is found,
/// returns a sensible fallback (default language value or the key itself).
pub fn tr(lang: Option<&str>, key: &str, params: Option<&[(&str, &str)]>) -> String {
    let map = translations();

    let desired = lang.unwrap_or(DEFAULT_LANG);

    // Try requested language
    let val = map
        .get(desired)
        .and_then(|m| m.get(key))
        .cloned()
        // Fallback to default language
        .or_else(|| map.get(DEFAULT_LANG).and_then(|m| m.get(key)).cloned())
        // If still missing, return the key itself (useful in logs)
        .unwrap_or_else(|| key.to_string());

    if let Some(params) = params {
        let mut s = val;
        for (k, v) in params {
            s = s.replace(&format!("{{{}}}", k), v);
        }
        s
    } else {
        val
    }
}

/// Convenience wrapper: translate using default language (DEFAULT_LANG).
pub fn t(key: &str) -> String {
    tr(None, key, None)
}

/// Convenience wrapper with params (default language).
pub fn t_with(key: &str, params: &[(&str, &str)]) -> String {
    tr(None, key, Some(params))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tr_basic() {
        let s = tr(Some("vi"), "permission.denied", None);
        assert_eq!(s, "Bạn đã từ chối thông báo");
    }

    #[test]
    fn test_t_with_params() {
        let s = t_with("reminder.single.title", &[("title", "Họp nhóm")]);
        assert_eq!(s, "Sự kiện hôm nay: Họp nhóm");

        let s = t_with(
            "reminder.multiple.body",
            &[("count", "3"), ("titles", "A, B, C")],
        );
        assert_eq!(s, "Có 3 sự kiện đang chờ bạn: A, B, C");
    }

    #[test]
    fn test_fallback_to_default() {
        // Unknown language falls back to default (vi)
        let s = tr(Some("fr"), "permission.dismissed", None);
        assert_eq!(s, "Bạn đã hủy yêu cầu thông báo");
    }

    #[test]
    fn missing_key_returns_key() {
        let k = "non.existent.key";
        let s = t(k);
        assert_eq!(s, k.to_string());
    }

    #[test]
    fn test_is_supported_language() {
        assert!(is_supported_language("vi"));
        assert!(is_supported_language("en"));
        assert!(!is_supported_language("fr"));
    }

    #[test]
    fn test_normalize_language() {
        assert_eq!(normalize_language("vi-VN"), "vi");
        assert_eq!(normalize_language("en"), "en");
        assert_eq!(normalize_language("EN-us"), "en");
    }
}
