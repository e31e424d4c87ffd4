/*!
# Symbion DevKit - test doubles for plugin development

Helps writing plugin tests without a broker:
- MQTT client stub recording publications and simulating inbound traffic
- Builders for Symbion bus payloads (metrics, asset changes)
- Manual clock to drive time-dependent plugins
- Test harness bundling the above with assertions on published JSON
*/

pub mod clock;
pub mod mqtt_stub;
pub mod test_utils;

pub use clock::ManualClock;
pub use mqtt_stub::{MockMessage, MockMqttClient, SymbionMessageBuilder};
pub use test_utils::TestHarness;
