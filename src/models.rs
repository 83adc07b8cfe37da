use serde::{Deserialize, Serialize};

/// Service categories accepted by the query endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceType {
    Web = 1,
    App = 6,
    MiniApp = 7,
    QuickApp = 8,
}

impl ServiceType {
    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn label(&self) -> &'static str {
        match self {
            ServiceType::Web => "web",
            ServiceType::App => "app",
            ServiceType::MiniApp => "miniapp",
            ServiceType::QuickApp => "quickapp",
        }
    }

    /// Whether records of this category are enriched via the detail endpoint.
    pub fn needs_detail_lookup(&self) -> bool {
        !matches!(self, ServiceType::Web)
    }
}

/// Parse a service-type selector; "all" expands to every category.
pub fn parse_service_types(s: &str) -> Option<Vec<ServiceType>> {
    match s.to_lowercase().as_str() {
        "web" | "1" => Some(vec![ServiceType::Web]),
        "app" | "6" => Some(vec![ServiceType::App]),
        "miniapp" | "7" => Some(vec![ServiceType::MiniApp]),
        "quickapp" | "8" => Some(vec![ServiceType::QuickApp]),
        "all" => Some(vec![
            ServiceType::Web,
            ServiceType::App,
            ServiceType::MiniApp,
            ServiceType::QuickApp,
        ]),
        _ => None,
    }
}

/// One unit to look up, immutable once loaded.
#[derive(Debug, Clone)]
pub struct QueryTarget {
    pub name: String,
    pub service_types: Vec<ServiceType>,
}

/// Normalized output record. Base fields are always present; category
/// specific fields are filled by the extractor.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResultRecord {
    pub unit_name: Option<String>,
    pub main_licence: Option<String>,
    pub service_licence: Option<String>,
    pub update_record_time: Option<String>,
    /// web only
    pub domain: Option<String>,
    /// app/miniapp/quickapp, from the detail endpoint
    pub service_name: Option<String>,
    pub leader_name: Option<String>,
    pub main_unit_address: Option<String>,
}

// ---- wire payloads ----

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub params: Option<TokenParams>,
}

#[derive(Debug, Deserialize)]
pub struct TokenParams {
    // upstream spells the field this way
    pub bussiness: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeParams {
    pub big_image: String,
    pub small_image: String,
    pub secret_key: String,
    pub uuid: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyResponse {
    pub code: Option<i64>,
    pub params: Option<VerifyParams>,
    pub msg: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyParams {
    pub sign: Option<String>,
}

/// Envelope shared by the query and detail endpoints.
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope {
    #[serde(default)]
    pub success: bool,
    pub code: Option<i64>,
    pub params: Option<serde_json::Value>,
    pub msg: Option<String>,
}

/// One raw element of the query list. Unmapped fields stay in `extra` so
/// the extractor can fall back on them without a schema change.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawItem {
    pub unit_name: Option<String>,
    pub main_licence: Option<String>,
    pub service_licence: Option<String>,
    pub update_record_time: Option<String>,
    pub domain: Option<String>,
    pub data_id: Option<serde_json::Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailParams {
    pub service_name: Option<String>,
    pub leader_name: Option<String>,
    pub main_unit_address: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_type_codes() {
        assert_eq!(ServiceType::Web.code(), 1);
        assert_eq!(ServiceType::App.code(), 6);
        assert_eq!(ServiceType::MiniApp.code(), 7);
        assert_eq!(ServiceType::QuickApp.code(), 8);
    }

    #[test]
    fn test_parse_service_types() {
        assert_eq!(parse_service_types("web").unwrap(), vec![ServiceType::Web]);
        assert_eq!(parse_service_types("APP").unwrap(), vec![ServiceType::App]);
        assert_eq!(parse_service_types("all").unwrap().len(), 4);
        assert!(parse_service_types("ftp").is_none());
    }

    #[test]
    fn test_detail_lookup_categories() {
        assert!(!ServiceType::Web.needs_detail_lookup());
        assert!(ServiceType::App.needs_detail_lookup());
        assert!(ServiceType::MiniApp.needs_detail_lookup());
        assert!(ServiceType::QuickApp.needs_detail_lookup());
    }

    #[test]
    fn test_raw_item_parses_upstream_shape() {
        let item: RawItem = serde_json::from_value(serde_json::json!({
            "unitName": "某某科技有限公司",
            "mainLicence": "京ICP备00000000号",
            "serviceLicence": "京ICP备00000000号-1",
            "updateRecordTime": "2024-01-01 00:00:00",
            "domain": "example.cn",
            "dataId": 123456,
            "contentTypeName": "出版"
        }))
        .unwrap();
        assert_eq!(item.unit_name.as_deref(), Some("某某科技有限公司"));
        assert_eq!(item.domain.as_deref(), Some("example.cn"));
        assert!(item.data_id.is_some());
        assert!(item.extra.contains_key("contentTypeName"));
    }
}
