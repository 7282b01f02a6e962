//! Wire message types: message kinds, the envelope, and the typed payloads
//! that travel inside it.

use chrono::{DateTime, Duration, Utc};
use price_core::{ItemDetails, PlaceDetails, PriceObservation};
use serde::{Deserialize, Serialize};

/// The kind of message carried in an [`Envelope`].
///
/// The discriminant order is part of the wire format: older peers send the
/// numeric index instead of the name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    PriceShare,
    PriceRequest,
    ItemShare,
    PlaceShare,
    SyncRequest,
    SyncResponse,
    Heartbeat,
    Error,
}

impl MessageType {
    pub const ALL: [MessageType; 8] = [
        Self::PriceShare,
        Self::PriceRequest,
        Self::ItemShare,
        Self::PlaceShare,
        Self::SyncRequest,
        Self::SyncResponse,
        Self::Heartbeat,
        Self::Error,
    ];

    /// Name written on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PriceShare => "PriceShare",
            Self::PriceRequest => "PriceRequest",
            Self::ItemShare => "ItemShare",
            Self::PlaceShare => "PlaceShare",
            Self::SyncRequest => "SyncRequest",
            Self::SyncResponse => "SyncResponse",
            Self::Heartbeat => "Heartbeat",
            Self::Error => "Error",
        }
    }

    /// Parse a wire name. Unknown names yield `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }

    /// Parse a legacy numeric tag.
    pub fn from_index(index: u64) -> Option<Self> {
        Self::ALL.get(usize::try_from(index).ok()?).copied()
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

fn default_fact_source() -> Option<String> {
    Some("p2p".to_string())
}

/// A single observed price, self-describing so that each node can map it
/// onto its own local items and stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceFact {
    pub item_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_brand: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_barcode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_size: Option<String>,

    pub store_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_chain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_suburb: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_state: Option<String>,

    pub price: f64,
    #[serde(default)]
    pub is_on_sale: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sale_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_to: Option<DateTime<Utc>>,
    #[serde(default = "default_fact_source", skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl PriceFact {
    /// A minimal fact: item, store and price.
    pub fn new(item_name: impl Into<String>, store_name: impl Into<String>, price: f64) -> Self {
        Self {
            item_name: item_name.into(),
            item_brand: None,
            item_category: None,
            item_barcode: None,
            package_size: None,
            store_name: store_name.into(),
            store_chain: None,
            store_suburb: None,
            store_state: None,
            price,
            is_on_sale: false,
            original_price: None,
            sale_description: None,
            valid_from: None,
            valid_to: None,
            source: default_fact_source(),
        }
    }

    /// Assemble a fact from locally stored parts.
    pub fn from_parts(item: &ItemDetails, place: &PlaceDetails, observation: &PriceObservation) -> Self {
        Self {
            item_name: item.name.clone(),
            item_brand: item.brand.clone(),
            item_category: item.category.clone(),
            item_barcode: item.barcode.clone(),
            package_size: item.package_size.clone(),
            store_name: place.name.clone(),
            store_chain: place.chain.clone(),
            store_suburb: place.suburb.clone(),
            store_state: place.state.clone(),
            price: observation.price,
            is_on_sale: observation.is_on_sale,
            original_price: observation.original_price,
            sale_description: observation.sale_description.clone(),
            valid_from: observation.valid_from,
            valid_to: observation.valid_to,
            source: default_fact_source(),
        }
    }

    pub fn item_details(&self) -> ItemDetails {
        ItemDetails {
            name: self.item_name.clone(),
            brand: self.item_brand.clone(),
            category: self.item_category.clone(),
            barcode: self.item_barcode.clone(),
            package_size: self.package_size.clone(),
        }
    }

    pub fn place_details(&self) -> PlaceDetails {
        PlaceDetails {
            name: self.store_name.clone(),
            chain: self.store_chain.clone(),
            suburb: self.store_suburb.clone(),
            state: self.store_state.clone(),
        }
    }

    pub fn observation(&self) -> PriceObservation {
        PriceObservation {
            price: self.price,
            is_on_sale: self.is_on_sale,
            original_price: self.original_price,
            sale_description: self.sale_description.clone(),
            valid_from: self.valid_from,
            valid_to: self.valid_to,
        }
    }
}

/// Payload of a `SyncRequest`: "send me what you recorded since `since`".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQuery {
    pub since: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub categories: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chains: Option<Vec<String>>,
}

impl SyncQuery {
    /// Query for everything recorded within `window` of now.
    pub fn recent(window: std::time::Duration, region: Option<String>) -> Self {
        let window = Duration::from_std(window).unwrap_or(Duration::days(7));
        Self {
            since: Utc::now() - window,
            region,
            categories: None,
            chains: None,
        }
    }
}

/// Payload of a `SyncResponse`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncBundle {
    pub facts: Vec<PriceFact>,
    pub count: usize,
    pub generated_at: DateTime<Utc>,
}

impl SyncBundle {
    pub fn new(facts: Vec<PriceFact>) -> Self {
        Self {
            count: facts.len(),
            facts,
            generated_at: Utc::now(),
        }
    }
}

/// Payload of a `Heartbeat`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl HeartbeatPayload {
    pub fn now() -> Self {
        Self {
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Message & envelope
// ---------------------------------------------------------------------------

/// A decoded message body. The payload type is fixed by the variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    PriceShare(PriceFact),
    SyncRequest(SyncQuery),
    SyncResponse(SyncBundle),
    Heartbeat(HeartbeatPayload),
    /// `PriceRequest`, `ItemShare`, `PlaceShare` and `Error` have no handler
    /// yet; their payload is kept as raw JSON text.
    Reserved { kind: MessageType, payload: String },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::PriceShare(_) => MessageType::PriceShare,
            Self::SyncRequest(_) => MessageType::SyncRequest,
            Self::SyncResponse(_) => MessageType::SyncResponse,
            Self::Heartbeat(_) => MessageType::Heartbeat,
            Self::Reserved { kind, .. } => *kind,
        }
    }

    /// Serialize the body into the opaque payload string.
    pub fn payload_json(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::PriceShare(fact) => serde_json::to_string(fact),
            Self::SyncRequest(query) => serde_json::to_string(query),
            Self::SyncResponse(bundle) => serde_json::to_string(bundle),
            Self::Heartbeat(beat) => serde_json::to_string(beat),
            Self::Reserved { payload, .. } => Ok(payload.clone()),
        }
    }

    /// Decode a payload string according to its message type.
    pub fn from_payload(kind: MessageType, payload: &str) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            MessageType::PriceShare => Self::PriceShare(serde_json::from_str(payload)?),
            MessageType::SyncRequest => Self::SyncRequest(serde_json::from_str(payload)?),
            MessageType::SyncResponse => Self::SyncResponse(serde_json::from_str(payload)?),
            MessageType::Heartbeat if payload.trim().is_empty() => {
                Self::Heartbeat(HeartbeatPayload::now())
            }
            MessageType::Heartbeat => Self::Heartbeat(serde_json::from_str(payload)?),
            kind => Self::Reserved {
                kind,
                payload: payload.to_string(),
            },
        })
    }
}

/// A decoded envelope: who sent it, when, and the typed body.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Node id of the sender.
    pub sender_id: String,
    /// When the sender created the message.
    pub timestamp: DateTime<Utc>,
    pub message: Message,
    /// Reserved for message signing; never populated or checked.
    pub signature: Option<String>,
}

impl Envelope {
    pub fn new(sender_id: impl Into<String>, message: Message) -> Self {
        Self {
            sender_id: sender_id.into(),
            timestamp: Utc::now(),
            message,
            signature: None,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.message.message_type()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_names_and_indices() {
        for (index, kind) in MessageType::ALL.iter().enumerate() {
            assert_eq!(MessageType::from_name(kind.as_str()), Some(*kind));
            assert_eq!(MessageType::from_index(index as u64), Some(*kind));
        }
        assert_eq!(MessageType::from_name("Gossip"), None);
        assert_eq!(MessageType::from_index(8), None);
        assert_eq!(MessageType::from_index(6), Some(MessageType::Heartbeat));
    }

    #[test]
    fn test_minimal_fact_payload_parses() {
        let fact: PriceFact =
            serde_json::from_str(r#"{"itemName":"Milk 2L","storeName":"Test Store","price":3.20}"#)
                .unwrap();
        assert_eq!(fact.item_name, "Milk 2L");
        assert_eq!(fact.store_name, "Test Store");
        assert!((fact.price - 3.20).abs() < f64::EPSILON);
        assert!(!fact.is_on_sale);
        assert_eq!(fact.source.as_deref(), Some("p2p"));
    }

    #[test]
    fn test_fact_omits_empty_optionals() {
        let json = serde_json::to_string(&PriceFact::new("Bread", "IGA", 2.5)).unwrap();
        assert!(json.contains("\"itemName\":\"Bread\""));
        assert!(json.contains("\"isOnSale\":false"));
        assert!(!json.contains("itemBrand"));
    }

    #[test]
    fn test_fact_parts_conversion() {
        let mut fact = PriceFact::new("Milk Full Cream 2L", "Coles Chatswood", 3.10);
        fact.item_brand = Some("Dairy Farmers".into());
        fact.store_chain = Some("Coles".into());
        fact.store_state = Some("NSW".into());
        fact.is_on_sale = true;
        fact.original_price = Some(3.50);

        let rebuilt =
            PriceFact::from_parts(&fact.item_details(), &fact.place_details(), &fact.observation());
        assert_eq!(rebuilt, fact);
    }

    #[test]
    fn test_reserved_payload_kept_raw() {
        let msg = Message::from_payload(MessageType::ItemShare, r#"{"name":"x"}"#).unwrap();
        assert_eq!(
            msg,
            Message::Reserved {
                kind: MessageType::ItemShare,
                payload: r#"{"name":"x"}"#.to_string()
            }
        );
        assert_eq!(msg.message_type(), MessageType::ItemShare);
    }

    #[test]
    fn test_heartbeat_tolerates_empty_payload() {
        let msg = Message::from_payload(MessageType::Heartbeat, "").unwrap();
        assert!(matches!(msg, Message::Heartbeat(_)));
        let msg = Message::from_payload(MessageType::Heartbeat, "{}").unwrap();
        assert!(matches!(msg, Message::Heartbeat(_)));
    }

    #[test]
    fn test_sync_query_recent_window() {
        let query = SyncQuery::recent(std::time::Duration::from_secs(3600), Some("NSW".into()));
        let age = Utc::now() - query.since;
        assert!(age >= Duration::minutes(59) && age <= Duration::minutes(61));
        assert_eq!(query.region.as_deref(), Some("NSW"));
    }

    #[test]
    fn test_bundle_count_matches_facts() {
        let bundle = SyncBundle::new(vec![
            PriceFact::new("A", "S", 1.0),
            PriceFact::new("B", "S", 2.0),
        ]);
        assert_eq!(bundle.count, 2);
    }
}
