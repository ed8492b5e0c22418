pub mod autoplay;
pub mod driver;
pub mod outcome;
pub mod relay;
pub mod round;
pub mod types;

pub use autoplay::AutoPlayOrchestrator;
pub use driver::{ControlEvent, Engine, EngineEvent};
pub use outcome::OutcomeGenerator;
pub use relay::RelayBridge;
pub use round::RoundController;
