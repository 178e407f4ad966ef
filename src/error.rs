//! Crate-wide error taxonomy (spec.md §7).
//!
//! `CoreError` aggregates the per-component error enums the way a
//! larger kernel's own top-level error type would aggregate subsystem
//! errors, with `From` conversions so `?` composes across module
//! boundaries. Every fallible public operation returns
//! `Result<T, CoreError>`; the cases spec.md §7 calls deliberately
//! fatal (QI deadline, hot-plug anomaly on a tunnel root, programmer
//! error) still come back as `Result` from the component that detected
//! them — the caller (controller / enumerator glue) decides whether to
//! abort, per SPEC_FULL.md §0.

use core::fmt;

/// Top-level error type returned by every fallible operation in this
/// crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreError {
    /// Confined to the component that raised it: queue pressure, or an
    /// operation invoked before its precondition holds.
    Transient(TransientError),
    /// The upstream link (or the device itself) is gone.
    LinkLost(LinkLostError),
    /// An allocator could not satisfy a request.
    NoResources(NoResourcesError),
    /// A bounded busy-wait (QI stamp, 600ms deadlines) was exceeded.
    /// Policy in spec.md §7: "deliberate policy: a missed invalidation
    /// would silently corrupt DMA" — the crate surfaces this as an
    /// error; the controller is responsible for treating it as fatal.
    DeadlineExceeded(DeadlineKind),
    /// A device behaved unexpectedly across a power transition.
    HotplugAnomaly(HotplugAnomaly),
    /// An invariant a caller is responsible for upholding was violated
    /// (section-difference by a non-power-of-two, double-prefix, etc).
    ProgrammerError(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientError {
    /// A free queue (C5/C7) is full; the caller should spin on
    /// `check_free` per spec.md §4.7.
    QueueFull,
    /// `save`/`restore` (C9) was invoked before its precondition holds
    /// (e.g. restore called on a shadow that was never saved).
    NotReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkLostError {
    /// `check_link` (C10) found a dead upstream link; the caller should
    /// skip the pending work.
    NoDevice,
    /// A tunnel root was missing during `restore_machine_state` (C9) —
    /// the spec marks this path as policy-fatal.
    MissingTunnelRoot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoResourcesError {
    /// No allocator (buddy or interval) could satisfy the request.
    AddressSpaceExhausted,
    /// A domain-id or IOVA range this caller wanted is already owned.
    AlreadyOwned,
    /// The global domain-id bitmap has none left (`domain_count`
    /// exhausted, spec.md §4.8).
    DomainIdsExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineKind {
    /// `context_invalidate`/`interrupt_invalidate` did not see every
    /// translating unit pass the stamp within the configured deadline.
    QiStampWait,
    /// `space_unmap_memory`'s free-queue drain timed out waiting for
    /// `check_free` to make room ("qfull" in spec.md §4.7).
    FreeQueueDrain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugAnomaly {
    /// Device read all-ones after restore and its shadow is `Hotplug` —
    /// the nub should be terminated.
    DeviceGoneTerminate,
    /// Device read all-ones after restore and its shadow is
    /// `Permanent` — report Offline rather than terminating.
    DeviceGoneOffline,
    /// Device read all-ones on a tunnel link with the "panic on
    /// tunnel-loss" policy bit set.
    TunnelLinkFatal,
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Transient(e) => write!(f, "transient error: {e}"),
            CoreError::LinkLost(e) => write!(f, "link lost: {e}"),
            CoreError::NoResources(e) => write!(f, "no resources: {e}"),
            CoreError::DeadlineExceeded(e) => write!(f, "deadline exceeded: {e}"),
            CoreError::HotplugAnomaly(e) => write!(f, "hot-plug anomaly: {e}"),
            CoreError::ProgrammerError(msg) => write!(f, "programmer error: {msg}"),
        }
    }
}

impl fmt::Display for TransientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransientError::QueueFull => write!(f, "queue full"),
            TransientError::NotReady => write!(f, "not ready"),
        }
    }
}

impl fmt::Display for LinkLostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkLostError::NoDevice => write!(f, "no device (link down)"),
            LinkLostError::MissingTunnelRoot => write!(f, "tunnel root missing during restore"),
        }
    }
}

impl fmt::Display for NoResourcesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoResourcesError::AddressSpaceExhausted => write!(f, "address space exhausted"),
            NoResourcesError::AlreadyOwned => write!(f, "range already owned"),
            NoResourcesError::DomainIdsExhausted => write!(f, "domain ids exhausted"),
        }
    }
}

impl fmt::Display for DeadlineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadlineKind::QiStampWait => write!(f, "QI stamp wait"),
            DeadlineKind::FreeQueueDrain => write!(f, "free queue drain (qfull)"),
        }
    }
}

impl fmt::Display for HotplugAnomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HotplugAnomaly::DeviceGoneTerminate => write!(f, "device gone, terminating nub"),
            HotplugAnomaly::DeviceGoneOffline => write!(f, "device gone, reporting offline"),
            HotplugAnomaly::TunnelLinkFatal => write!(f, "tunnel link lost under fatal policy"),
        }
    }
}

impl From<TransientError> for CoreError {
    fn from(e: TransientError) -> Self {
        CoreError::Transient(e)
    }
}

impl From<LinkLostError> for CoreError {
    fn from(e: LinkLostError) -> Self {
        CoreError::LinkLost(e)
    }
}

impl From<NoResourcesError> for CoreError {
    fn from(e: NoResourcesError) -> Self {
        CoreError::NoResources(e)
    }
}

impl From<DeadlineKind> for CoreError {
    fn from(e: DeadlineKind) -> Self {
        CoreError::DeadlineExceeded(e)
    }
}

impl From<HotplugAnomaly> for CoreError {
    fn from(e: HotplugAnomaly) -> Self {
        CoreError::HotplugAnomaly(e)
    }
}

/// Crate-wide result alias.
pub type CoreResult<T> = Result<T, CoreError>;

/// Log a `CoreError` at the level matching its spec.md §7 class
/// (`Transient` -> debug/warn, `LinkLost`/`NoResources` -> warn,
/// `DeadlineExceeded`/`HotplugAnomaly` fatal paths -> error), per
/// SPEC_FULL.md §0's logging contract. Call this once at the point an
/// error is about to be returned to a caller outside the component.
pub fn log_error(err: &CoreError) {
    match err {
        CoreError::Transient(TransientError::QueueFull) => log::debug!("{err}"),
        CoreError::Transient(_) => log::warn!("{err}"),
        CoreError::LinkLost(_) | CoreError::NoResources(_) => log::warn!("{err}"),
        CoreError::DeadlineExceeded(_) | CoreError::HotplugAnomaly(_) => log::error!("{err}"),
        CoreError::ProgrammerError(_) => log::error!("{err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions_round_trip_through_question_mark() {
        fn inner() -> CoreResult<()> {
            Err(TransientError::QueueFull)?
        }
        assert_eq!(
            inner(),
            Err(CoreError::Transient(TransientError::QueueFull))
        );
    }

    #[test]
    fn display_is_human_readable() {
        let e = CoreError::DeadlineExceeded(DeadlineKind::QiStampWait);
        assert_eq!(format!("{e}"), "deadline exceeded: QI stamp wait");
    }
}
