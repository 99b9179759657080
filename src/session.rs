//! Session controller & trigger sub-protocol (`spec.md` §4.5).
//!
//! Mirrors the device-side state machine from the plotter's perspective:
//! drives the command lifecycle (idle/armed/sampling/stopping) and reacts
//! to TRIGGER packets arriving on the data port by sending exactly one
//! TRIGGER_ACK per fresh trigger.
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use log::{info, warn};

use crate::command::CommandEndpoint;
use crate::device::{Device, SessionState};
use crate::error::{SessionError, SessionResult};
use crate::frame::TriggerBody;

/// Drives the command lifecycle and trigger sub-protocol for every device
/// in a [`crate::device::DeviceRegistry`]. Holds no per-device state of its
/// own — that lives in each [`Device`]'s aggregate.
pub struct SessionController {
    endpoint: CommandEndpoint,
    command_port: u16,
}

impl SessionController {
    pub fn new(endpoint: CommandEndpoint, command_port: u16) -> Self {
        Self { endpoint, command_port }
    }

    pub fn endpoint(&self) -> &CommandEndpoint {
        &self.endpoint
    }

    fn command_addr(&self, device: &Device) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(device.addr, self.command_port))
    }

    /// GET_ID, then records the discovered channel count on the device's
    /// aggregate, (re)allocating its reorder/ring buffers (`spec.md` §3
    /// Lifecycles).
    pub fn get_id(&self, device: &Device) -> SessionResult<crate::frame::IdentificationRecord> {
        let id = self.endpoint.get_id(self.command_addr(device))?;
        let mut agg = device.aggregate.lock().unwrap();
        agg.set_channel_count(id.channels_count as usize)?;
        Ok(id)
    }

    pub fn ping(&self, device: &Device) -> SessionResult<()> {
        Ok(self.endpoint.ping(self.command_addr(device))?)
    }

    /// REGISTER_RECEIVER — also updates the local mirror of the device's
    /// receiver list so the UI can list receivers without a round trip.
    pub fn register_receiver(
        &self,
        device: &Device,
        ip: Ipv4Addr,
        port: u16,
    ) -> SessionResult<crate::command::RegisteredReceiver> {
        let registered = self.endpoint.register_receiver(self.command_addr(device), ip, port)?;
        let mut agg = device.aggregate.lock().unwrap();
        agg.receivers.register(registered.addr.ip, registered.addr.port);
        Ok(registered)
    }

    pub fn remove_receiver(&self, device: &Device, ip: Ipv4Addr, port: u16) -> SessionResult<crate::command::ReceiverAddr> {
        let removed = self.endpoint.remove_receiver(self.command_addr(device), ip, port)?;
        let mut agg = device.aggregate.lock().unwrap();
        agg.receivers.remove(removed.ip, removed.port);
        Ok(removed)
    }

    pub fn get_receivers(&self, device: &Device) -> SessionResult<Vec<crate::command::ReceiverAddr>> {
        Ok(self.endpoint.get_receivers(self.command_addr(device))?)
    }

    /// START_SAMPLING. Refuses locally with [`SessionError::ChannelCountUnknown`]
    /// if GET_ID hasn't run yet (`spec.md` §7), and with
    /// [`SessionError::WrongState`] unless the device is IDLE.
    pub fn start_sampling(&self, device: &Device, num_packets: u32) -> SessionResult<u64> {
        self.check_start_preconditions(device)?;
        let echoed = self.endpoint.start_sampling(self.command_addr(device), num_packets)?;
        let mut agg = device.aggregate.lock().unwrap();
        agg.reorder.reset();
        agg.session = SessionState::Sampling;
        agg.packets_sent = 0;
        Ok(echoed)
    }

    /// START_ON_TRIGGER. Same preconditions as [`Self::start_sampling`];
    /// leaves the device ARMED_FOR_TRIGGER until a TRIGGER arrives.
    pub fn start_on_trigger(&self, device: &Device, num_packets: u32) -> SessionResult<u64> {
        self.check_start_preconditions(device)?;
        let echoed = self.endpoint.start_on_trigger(self.command_addr(device), num_packets)?;
        let mut agg = device.aggregate.lock().unwrap();
        agg.session = SessionState::ArmedForTrigger;
        Ok(echoed)
    }

    fn check_start_preconditions(&self, device: &Device) -> SessionResult<()> {
        let agg = device.aggregate.lock().unwrap();
        if agg.channel_count == 0 {
            return Err(SessionError::ChannelCountUnknown);
        }
        if agg.session != SessionState::Idle {
            return Err(SessionError::WrongState {
                wanted: "IDLE",
                found: state_name(agg.session),
            });
        }
        Ok(())
    }

    /// STOP_SAMPLING. Always transitions the device to IDLE and drains the
    /// reorder buffer, even if the ACK never arrives (`spec.md` §4.5
    /// Failure semantics) — in that case a warning is logged and the
    /// [`CommandError::NoReply`] is still surfaced to the caller.
    pub fn stop_sampling(&self, device: &Device) -> SessionResult<u64> {
        {
            let mut agg = device.aggregate.lock().unwrap();
            agg.session = SessionState::Stopping;
        }
        let result = self.endpoint.stop_sampling(self.command_addr(device));

        let mut agg = device.aggregate.lock().unwrap();
        agg.flush_all();
        agg.session = SessionState::Idle;

        match result {
            Ok(packets_sent) => {
                agg.packets_sent = packets_sent;
                Ok(packets_sent)
            }
            Err(e) => {
                warn!("STOP_SAMPLING to {}: no ACK, transitioning to IDLE anyway", device.addr);
                Err(SessionError::Command(e))
            }
        }
    }

    /// FORCE_TRIGGER — fire-and-forget (`spec.md` §4.5).
    pub fn force_trigger(&self, device: &Device) -> SessionResult<()> {
        Ok(self.endpoint.force_trigger(self.command_addr(device))?)
    }

    /// Handles a TRIGGER packet arriving on the data port: if the device
    /// was ARMED_FOR_TRIGGER, transitions it to SAMPLING with its sequence
    /// restarting at zero; a TRIGGER received while IDLE is still honored
    /// (`spec.md` §4.5). Sends exactly one TRIGGER_ACK per fresh
    /// `packet_id`, ignoring retransmits of a trigger already acked.
    pub fn handle_trigger(&self, device: &Device, trigger: TriggerBody) -> SessionResult<()> {
        let already_acked = {
            let mut agg = device.aggregate.lock().unwrap();
            let already = agg.last_trigger_ack == Some(trigger.packet_id);
            if !already {
                if agg.session == SessionState::ArmedForTrigger {
                    agg.session = SessionState::Sampling;
                    agg.reorder.reset();
                    info!("{}: trigger fired, now SAMPLING", device.addr);
                }
                agg.last_trigger_ack = Some(trigger.packet_id);
            }
            already
        };
        if already_acked {
            return Ok(());
        }
        Ok(self.endpoint.trigger_ack(self.command_addr(device))?)
    }
}

fn state_name(state: SessionState) -> &'static str {
    match state {
        SessionState::Idle => "IDLE",
        SessionState::ArmedForTrigger => "ARMED_FOR_TRIGGER",
        SessionState::Sampling => "SAMPLING",
        SessionState::Stopping => "STOPPING",
    }
}

/// Sequences a leader/follower group: every follower is given
/// START_ON_TRIGGER before the leader receives START_SAMPLING
/// (`spec.md` §4.5 Leader/follower orchestration). Stops on the first
/// failure, leaving later devices untouched.
pub fn start_leader_follower_group(
    controller: &SessionController,
    leader: &Device,
    followers: &[&Device],
    num_packets: u32,
) -> SessionResult<()> {
    for follower in followers {
        controller.start_on_trigger(follower, num_packets)?;
    }
    controller.start_sampling(leader, num_packets)?;
    Ok(())
}
