/*!
# Morio Tap DevKit

Helpers for writing and testing tap processors without a broker, a
store or an inventory database:
- `TestHarness`: a dispatcher wired to in-memory adapters
- `RecordingProcessor`: records every envelope it is handed, can be told to fail
- `MessageBuilder` and `fixtures`: inbound records and ECS-shaped payloads
*/

pub mod messages;
pub mod recording;
pub mod test_utils;

pub use messages::{fixtures, MessageBuilder};
pub use recording::RecordingProcessor;
pub use test_utils::TestHarness;
