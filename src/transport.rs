//! Card reader transport boundary.
//!
//! The driver never talks to hardware directly. A transport collaborator
//! (PN532/PN533 over USB or UART, a BLE bridge, or the in-memory
//! [`crate::sim::SimulatedCard`]) owns framing timers, parity, and radio
//! details, and exposes just two operations here.

use thiserror::Error;

/// Failures a transport collaborator can raise.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The card stayed silent. Real tags answer malformed or unexpected
    /// frames with silence rather than an error code.
    #[error("card gave no response")]
    NoResponse,
    /// The card left the field mid-exchange.
    #[error("card lost")]
    CardLost,
    /// Reader-side I/O failure.
    #[error("transceive failed: {0}")]
    Io(String),
}

/// A raw exchange channel to one selected card.
///
/// `transceive` sends an already framed command and returns the raw response
/// bytes; `reconnect` drops the current card session and re-selects the card
/// (wakeup plus anticollision on real hardware), after which a fresh
/// authentication is required.
pub trait CardTransport {
    fn transceive(&mut self, data: &[u8]) -> Result<Vec<u8>, TransportError>;
    fn reconnect(&mut self) -> Result<(), TransportError>;
}
