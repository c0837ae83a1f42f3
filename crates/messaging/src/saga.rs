//! Saga correlation bindings (mechanics only, no saga persistence).
//!
//! - A saga instance is identified by the value of one of its correlation properties
//! - Each incoming message type that a saga handles declares how to read that value
//!   from the message body
//! - The runtime uses `(saga data type, property name, property value)` to serialize
//!   concurrent handling of the same saga instance
//!
//! Loading and storing saga data is left to the handler; this module only describes
//! *which* instance a message belongs to.

use std::sync::Arc;

use serde_json::Value as JsonValue;

use courier_core::Message;

type ValueOf = Arc<dyn Fn(&Message) -> Option<String> + Send + Sync>;

/// How one message type maps onto one correlation property of a saga.
#[derive(Clone)]
pub struct CorrelationProperty {
    message_type: String,
    property_name: String,
    value_of: ValueOf,
}

impl core::fmt::Debug for CorrelationProperty {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CorrelationProperty")
            .field("message_type", &self.message_type)
            .field("property_name", &self.property_name)
            .finish_non_exhaustive()
    }
}

impl CorrelationProperty {
    /// Correlate `message_type` on saga property `property_name` using a custom extractor.
    pub fn new<F>(
        message_type: impl Into<String>,
        property_name: impl Into<String>,
        value_of: F,
    ) -> Self
    where
        F: Fn(&Message) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            message_type: message_type.into(),
            property_name: property_name.into(),
            value_of: Arc::new(value_of),
        }
    }

    /// Correlate on a top-level field of the JSON body.
    ///
    /// Strings are used as-is; numbers and booleans use their JSON text. Other
    /// values (missing, null, objects, arrays) do not correlate.
    pub fn from_json_field(
        message_type: impl Into<String>,
        json_field: impl Into<String>,
        property_name: impl Into<String>,
    ) -> Self {
        let field = json_field.into();
        Self::new(message_type, property_name, move |message: &Message| {
            match message.body().get(&field)? {
                JsonValue::String(s) => Some(s.clone()),
                v @ (JsonValue::Number(_) | JsonValue::Bool(_)) => Some(v.to_string()),
                _ => None,
            }
        })
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn property_name(&self) -> &str {
        &self.property_name
    }

    /// The correlation value for `message`, if this property applies to it.
    pub fn value_for(&self, message: &Message) -> Option<String> {
        if message.message_type() != self.message_type {
            return None;
        }
        (self.value_of)(message)
    }
}

/// Declares that a handler operates on instances of one saga data type.
#[derive(Debug, Clone)]
pub struct SagaBinding {
    saga_data_type: String,
    correlations: Vec<CorrelationProperty>,
}

impl SagaBinding {
    pub fn new(saga_data_type: impl Into<String>) -> Self {
        Self {
            saga_data_type: saga_data_type.into(),
            correlations: Vec::new(),
        }
    }

    pub fn correlate(mut self, property: CorrelationProperty) -> Self {
        self.correlations.push(property);
        self
    }

    pub fn saga_data_type(&self) -> &str {
        &self.saga_data_type
    }

    pub fn correlations(&self) -> &[CorrelationProperty] {
        &self.correlations
    }

    /// `(property name, value)` for every correlation that applies to `message`.
    pub fn correlation_values<'a>(
        &'a self,
        message: &'a Message,
    ) -> impl Iterator<Item = (&'a str, String)> + 'a {
        self.correlations
            .iter()
            .filter_map(move |c| c.value_for(message).map(|v| (c.property_name(), v)))
    }
}

/// Saga contract (correlation only).
///
/// Implementors name their saga data type and list how incoming message types map
/// onto its correlation properties.
pub trait Saga: Send + Sync + 'static {
    /// Stable saga data type identifier (e.g. "sagas.OrderFulfilment").
    fn saga_data_type() -> &'static str;

    /// Correlation properties for every message type this saga handles.
    fn correlations() -> Vec<CorrelationProperty>;

    fn binding() -> SagaBinding {
        Self::correlations()
            .into_iter()
            .fold(SagaBinding::new(Self::saga_data_type()), SagaBinding::correlate)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    struct OrderSaga;

    impl Saga for OrderSaga {
        fn saga_data_type() -> &'static str {
            "sagas.Order"
        }

        fn correlations() -> Vec<CorrelationProperty> {
            vec![
                CorrelationProperty::from_json_field("OrderPlaced", "order_id", "OrderId"),
                CorrelationProperty::from_json_field("PaymentReceived", "order", "OrderId"),
                CorrelationProperty::from_json_field("PaymentReceived", "invoice_no", "InvoiceNo"),
            ]
        }
    }

    #[test]
    fn only_properties_for_the_message_type_apply() {
        let binding = OrderSaga::binding();
        let placed = Message::new("OrderPlaced", json!({ "order_id": "o-1", "order": "x" }));

        let values: Vec<_> = binding.correlation_values(&placed).collect();
        assert_eq!(values, vec![("OrderId", "o-1".to_string())]);
    }

    #[test]
    fn numbers_correlate_and_missing_fields_do_not() {
        let binding = OrderSaga::binding();
        let paid = Message::new("PaymentReceived", json!({ "order": "o-1", "invoice_no": 42 }));
        let values: Vec<_> = binding.correlation_values(&paid).collect();
        assert_eq!(
            values,
            vec![("OrderId", "o-1".to_string()), ("InvoiceNo", "42".to_string())]
        );

        let partial = Message::new("PaymentReceived", json!({ "order": null }));
        assert_eq!(binding.correlation_values(&partial).count(), 0);
    }
}
