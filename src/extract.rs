//! Normalizes raw query items into `ResultRecord`s.
//!
//! Base fields are always copied. Web records carry their domain inline;
//! app/miniapp/quickapp records need one detail lookup by `dataId` to pick
//! up the service name and contact fields. A missing identifier never
//! fails the batch.

use log::warn;
use serde_json::Value;

use crate::credentials::CredentialSource;
use crate::dispatcher::Dispatcher;
use crate::error::QueryError;
use crate::models::{DetailParams, RawItem, ResultRecord, ServiceType};
use crate::transport::QueryTransport;

/// Builds one record, issuing the detail lookup through the dispatcher so
/// proxy rotation accounting stays global. Fatal errors propagate; when
/// the lookup fails or the item has no identifier, enrichment fields are
/// read inline from the list item instead.
pub async fn build_record<T: QueryTransport, C: CredentialSource>(
    dispatcher: &mut Dispatcher<'_, T, C>,
    item: &RawItem,
    service_type: ServiceType,
) -> Result<ResultRecord, QueryError> {
    let mut record = base_record(item, service_type);

    if service_type.needs_detail_lookup() {
        match &item.data_id {
            None => {
                warn!(
                    "item {:?} has no dataId, using inline fields",
                    item.unit_name.as_deref().unwrap_or("<unnamed>")
                );
                apply_inline(&mut record, item);
            }
            Some(data_id) => match dispatcher.detail_lookup(data_id, service_type).await {
                Ok(body) => apply_detail(&mut record, &body),
                Err(e) if e.is_fatal() || matches!(e, QueryError::Cancelled) => return Err(e),
                Err(e) => {
                    warn!("detail lookup failed, using inline fields: {}", e);
                    apply_inline(&mut record, item);
                }
            },
        }
    }
    Ok(record)
}

/// The always-present fields, plus the inline domain for web records.
pub fn base_record(item: &RawItem, service_type: ServiceType) -> ResultRecord {
    ResultRecord {
        unit_name: item.unit_name.clone(),
        main_licence: item.main_licence.clone(),
        service_licence: item.service_licence.clone(),
        update_record_time: item.update_record_time.clone(),
        domain: if service_type == ServiceType::Web {
            item.domain.clone()
        } else {
            None
        },
        ..Default::default()
    }
}

/// Some list payloads carry the enrichment fields inline; used when the
/// detail endpoint cannot be consulted.
fn apply_inline(record: &mut ResultRecord, item: &RawItem) {
    let field = |key: &str| {
        item.extra
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    record.service_name = field("serviceName");
    record.leader_name = field("leaderName");
    record.main_unit_address = field("mainUnitAddress");
}

fn apply_detail(record: &mut ResultRecord, body: &Value) {
    let params = match body.get("params") {
        Some(p) => p.clone(),
        None => return,
    };
    match serde_json::from_value::<DetailParams>(params) {
        Ok(detail) => {
            record.service_name = detail.service_name;
            record.leader_name = detail.leader_name;
            record.main_unit_address = detail.main_unit_address;
        }
        Err(e) => warn!("malformed detail params: {}", e),
    }
}
