use crate::net::buffer::NetBuffer;
use crate::tls::engine::{Engine, EngineError, EngineStatus, HandshakeStatus, NetReader};

/// Opcode returned by a step, interpreted by the connection's dispatcher.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Op {
    /// Nothing left to do in this direction.
    None,
    /// The destination buffer must be drained: ship net-out to the peer, or
    /// deliver app-in to the application.
    DrainDest,
    /// The engine closed; tear the connection down.
    EngineClose,
    /// More network data is needed before unwrapping can continue.
    LoadSrc,
    /// Delegated tasks must run off-thread before the handshake proceeds.
    ScheduleTasks,
    /// Switch the dispatcher to the unwrap direction.
    ScheduleUnwrap,
    /// Switch the dispatcher to the wrap direction.
    ScheduleWrap,
    /// Swap the current and other state.
    StateChange,
}

/// Which of the two step states is current.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StateKind {
    Active,
    Handshake,
}

impl StateKind {
    #[inline]
    pub fn other(self) -> StateKind {
        match self {
            StateKind::Active => StateKind::Handshake,
            StateKind::Handshake => StateKind::Active,
        }
    }

    pub fn step(self) -> &'static dyn StepState {
        match self {
            StateKind::Active => &ActiveState,
            StateKind::Handshake => &HandshakeState,
        }
    }
}

/// One of the two interleaved machines driving the engine. Both expose the
/// same step operations; the dispatcher swaps between them on `StateChange`.
pub trait StepState {
    fn step_unwrap(
        &self,
        engine: &mut dyn Engine,
        net_in: &mut NetBuffer,
        app_in: &mut NetBuffer,
    ) -> Result<Op, EngineError>;

    fn step_wrap(
        &self,
        engine: &mut dyn Engine,
        src: &mut NetReader<'_>,
        net_out: &mut NetBuffer,
    ) -> Result<Op, EngineError>;
}

/// Steady-state record processing after the handshake has completed.
pub struct ActiveState;

impl StepState for ActiveState {
    fn step_unwrap(
        &self,
        engine: &mut dyn Engine,
        net_in: &mut NetBuffer,
        app_in: &mut NetBuffer,
    ) -> Result<Op, EngineError> {
        loop {
            net_in.flip_read();
            app_in.flip_append();

            let result = engine.unwrap(net_in, app_in)?;

            match result.status {
                EngineStatus::BufferOverflow => {
                    if !app_in.is_empty() {
                        return Ok(Op::DrainDest);
                    }
                    let required = engine.app_buffer_size();
                    if app_in.needs_resize(required) {
                        app_in.resize(required);
                    } else {
                        app_in.compact();
                    }
                    continue;
                }
                EngineStatus::BufferUnderflow => {
                    // A partial record: make room at the tail of net-in and
                    // wait for the rest.
                    let required = engine.packet_buffer_size();
                    if net_in.needs_resize(required) {
                        net_in.resize(required);
                    } else if !net_in.is_compacted() {
                        net_in.compact();
                    }
                    if !app_in.is_empty() {
                        return Ok(Op::DrainDest);
                    }
                    return Ok(Op::LoadSrc);
                }
                EngineStatus::Closed => {
                    if result.handshake == HandshakeStatus::NotHandshaking {
                        return Ok(Op::EngineClose);
                    }
                }
                EngineStatus::Ok => {}
            }

            match result.handshake {
                HandshakeStatus::NotHandshaking => continue,
                _ => {
                    if !app_in.is_empty() {
                        return Ok(Op::DrainDest);
                    }
                    return Ok(Op::StateChange);
                }
            }
        }
    }

    fn step_wrap(
        &self,
        engine: &mut dyn Engine,
        src: &mut NetReader<'_>,
        net_out: &mut NetBuffer,
    ) -> Result<Op, EngineError> {
        loop {
            net_out.flip_append();

            // With no plaintext pending and no engine-internal records to
            // flush, application-level sends settle immediately.
            if src.is_empty() && !engine.wants_wrap() {
                return Ok(Op::DrainDest);
            }

            let result = engine.wrap(src, net_out)?;

            match result.status {
                EngineStatus::BufferOverflow => {
                    if net_out.is_empty() {
                        let required = engine.packet_buffer_size();
                        if net_out.needs_resize(required) {
                            net_out.resize(required);
                            continue;
                        }
                        net_out.compact();
                        continue;
                    }
                    return Ok(Op::DrainDest);
                }
                EngineStatus::BufferUnderflow => return Ok(Op::DrainDest),
                EngineStatus::Closed => {
                    if result.handshake == HandshakeStatus::NotHandshaking {
                        if !net_out.is_empty() {
                            return Ok(Op::DrainDest);
                        }
                        return Ok(Op::EngineClose);
                    }
                }
                EngineStatus::Ok => {}
            }

            match result.handshake {
                HandshakeStatus::NotHandshaking => continue,
                _ => return Ok(Op::StateChange),
            }
        }
    }
}

/// Handshake-driven record processing. Differs from the active state in that
/// the handshake status, not the application, decides what happens next.
pub struct HandshakeState;

impl StepState for HandshakeState {
    fn step_unwrap(
        &self,
        engine: &mut dyn Engine,
        net_in: &mut NetBuffer,
        app_in: &mut NetBuffer,
    ) -> Result<Op, EngineError> {
        loop {
            net_in.flip_read();
            app_in.flip_append();

            let result = engine.unwrap(net_in, app_in)?;

            match result.status {
                EngineStatus::BufferUnderflow => {
                    let required = engine.packet_buffer_size();
                    if net_in.needs_resize(required) {
                        net_in.resize(required);
                    } else if !net_in.is_compacted() {
                        net_in.compact();
                    }
                    return Ok(Op::LoadSrc);
                }
                EngineStatus::Closed => return Ok(Op::EngineClose),
                EngineStatus::BufferOverflow => {
                    // Handshake records produce no application data; an
                    // overflow can only be a capacity hint.
                    app_in.resize(engine.app_buffer_size());
                    continue;
                }
                EngineStatus::Ok => {}
            }

            match result.handshake {
                HandshakeStatus::NeedTask => return Ok(Op::ScheduleTasks),
                HandshakeStatus::NeedWrap => return Ok(Op::ScheduleWrap),
                HandshakeStatus::NeedUnwrap => continue,
                HandshakeStatus::Finished | HandshakeStatus::NotHandshaking => {
                    return Ok(Op::StateChange)
                }
            }
        }
    }

    fn step_wrap(
        &self,
        engine: &mut dyn Engine,
        src: &mut NetReader<'_>,
        net_out: &mut NetBuffer,
    ) -> Result<Op, EngineError> {
        loop {
            net_out.flip_append();

            let result = engine.wrap(src, net_out)?;

            match result.status {
                EngineStatus::BufferOverflow => {
                    if net_out.is_empty() {
                        let required = engine.packet_buffer_size();
                        if net_out.needs_resize(required) {
                            net_out.resize(required);
                        } else {
                            net_out.compact();
                        }
                        continue;
                    }
                    return Ok(Op::DrainDest);
                }
                EngineStatus::Closed => {
                    if !net_out.is_empty() {
                        return Ok(Op::DrainDest);
                    }
                    return Ok(Op::EngineClose);
                }
                EngineStatus::BufferUnderflow => return Ok(Op::DrainDest),
                EngineStatus::Ok => {}
            }

            match result.handshake {
                HandshakeStatus::NeedWrap => continue,
                HandshakeStatus::NeedTask => {
                    if !net_out.is_empty() {
                        return Ok(Op::DrainDest);
                    }
                    return Ok(Op::ScheduleTasks);
                }
                HandshakeStatus::NeedUnwrap => {
                    if !net_out.is_empty() {
                        return Ok(Op::DrainDest);
                    }
                    return Ok(Op::ScheduleUnwrap);
                }
                HandshakeStatus::Finished | HandshakeStatus::NotHandshaking => {
                    if !net_out.is_empty() {
                        return Ok(Op::DrainDest);
                    }
                    return Ok(Op::StateChange);
                }
            }
        }
    }
}
