//! Type-based routing for `Bus::send`.

use std::collections::HashMap;

use courier_core::{BusError, BusResult};

/// Maps message types to the address that owns them.
#[derive(Debug, Clone, Default)]
pub struct Router {
    routes: HashMap<String, String>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `message_type` to `address`. A later route for the same type replaces the
    /// earlier one.
    pub fn map(&mut self, message_type: impl Into<String>, address: impl Into<String>) -> &mut Self {
        self.routes.insert(message_type.into(), address.into());
        self
    }

    pub fn route(&self, message_type: &str) -> BusResult<&str> {
        self.routes
            .get(message_type)
            .map(String::as_str)
            .ok_or_else(|| BusError::NoRoute(message_type.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_by_type_and_reports_missing_routes() {
        let mut router = Router::new();
        router.map("InvoiceRequested", "billing").map("OrderShipped", "shipping");
        router.map("InvoiceRequested", "billing-v2");

        assert_eq!(router.route("InvoiceRequested").unwrap(), "billing-v2");
        assert_eq!(router.route("OrderShipped").unwrap(), "shipping");
        assert!(matches!(router.route("Unknown"), Err(BusError::NoRoute(t)) if t == "Unknown"));
    }
}
