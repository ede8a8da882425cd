/*!
# twinlink DevKit - mocks and fixtures for agent tests

- In-memory transport and connector, no broker needed
- Scripted components for the device model tree
- Manual clock for backoff timing
- Harness wiring them to the agent flows
*/

pub mod fixtures;
pub mod mock_transport;
pub mod test_utils;

pub use fixtures::{Reading, ScriptedComponent, ScriptedRoot};
pub use mock_transport::{InboundHandle, ManualClock, MockConnector, MockTransport};
pub use test_utils::{TestHarness, TestStats};
