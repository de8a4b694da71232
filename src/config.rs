//! Controller configuration trait.

use crate::{
    crypto::BlockCipher, cs::procedure::RadioScheduler, cs::report::Host, l2cap::Multiplexer,
};

/// Trait for controller configurations.
///
/// This trait defines the types of the collaborators the [`Controller`] drives: the AES engine,
/// the radio command scheduler, the host interface, and the host's channel multiplexer.
///
/// Every application must define a type implementing this trait and supply it to the controller.
///
/// [`Controller`]: ../controller/struct.Controller.html
pub trait Config {
    /// AES-128 block encryption, used by the CS DRBG.
    type Cipher: BlockCipher;

    /// The radio command scheduler that executes CS steps.
    type Scheduler: RadioScheduler;

    /// Receives step results and procedure status events.
    type Host: Host;

    /// The L2CAP channel registry, whose state travels with a handover.
    type Multiplexer: Multiplexer;
}
