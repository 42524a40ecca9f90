//! Combo monitor - device discovery, per-device tracking, suppression
//!
//! One task per keyboard device runs a `ComboTracker` over the device's
//! event stream and posts engage/release edges to the control channel. A
//! supervisor rescans the device list every second, so a device that the
//! system disabled or that disappeared mid-session is picked up again as
//! soon as it returns.
//!
//! Suppression: when the combo has a literal key, each device is grabbed
//! exclusively and every event except that key is re-emitted through a
//! virtual uinput device. If the grab fails the monitor degrades to
//! detection without suppression.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use evdev::uinput::{VirtualDevice, VirtualDeviceBuilder};
use evdev::{Device, InputEventKind, Key};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::detector::{ComboEdge, ComboTracker, KeyVerdict};
use super::KeyCombo;
use crate::state_machine::ControlEvent;

/// How often the supervisor re-enumerates keyboards; doubles as the
/// re-attach backoff after a device error.
const RESCAN_INTERVAL: Duration = Duration::from_secs(1);

/// Find all keyboard devices on the system.
pub fn find_keyboards() -> Vec<(PathBuf, Device)> {
    evdev::enumerate()
        .filter_map(|(path, device)| {
            // A keyboard should support common keys
            let is_keyboard = device.supported_keys().map_or(false, |keys| {
                keys.contains(Key::KEY_ENTER)
                    && keys.contains(Key::KEY_SPACE)
                    && keys.contains(Key::KEY_A)
                    && keys.contains(Key::KEY_Z)
            });
            is_keyboard.then_some((path, device))
        })
        .collect()
}

/// Check that input devices are accessible at all.
pub fn check_permissions(keyboards: &[(PathBuf, Device)]) -> Result<(), String> {
    if keyboards.is_empty() {
        let all_devices: Vec<_> = evdev::enumerate().collect();

        if all_devices.is_empty() {
            return Err(
                "No input devices found. Ensure you are in the 'input' group:\n\
                 sudo usermod -aG input $USER\n\
                 Then log out and back in."
                    .to_string(),
            );
        } else {
            return Err(format!(
                "Found {} input devices but none appear to be keyboards. \
                 This might be a permissions issue or no keyboard is connected.",
                all_devices.len()
            ));
        }
    }

    Ok(())
}

/// Watches all keyboards for the configured combo.
pub struct ComboMonitor {
    cancel: CancellationToken,
}

impl ComboMonitor {
    /// Start monitoring. Posts `ComboEngaged`/`ComboReleased` on `tx`.
    pub fn start(
        tx: mpsc::Sender<ControlEvent>,
        combo: KeyCombo,
        suppress: bool,
    ) -> Result<Self, String> {
        if !combo.is_valid() {
            return Err("Combo has no keys configured".to_string());
        }

        let keyboards = find_keyboards();
        check_permissions(&keyboards)?;

        log::info!(
            "Watching combo {} on {} keyboard(s){}",
            combo,
            keyboards.len(),
            if suppress && combo.key.is_some() {
                " with key suppression"
            } else {
                ""
            }
        );

        let cancel = CancellationToken::new();
        tokio::spawn(supervise(tx, combo, suppress, cancel.clone()));

        Ok(Self { cancel })
    }

    pub fn stop(&self) {
        log::info!("Stopping combo monitor");
        self.cancel.cancel();
    }
}

impl Drop for ComboMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Keep one monitor task alive per keyboard, rescanning for devices that
/// died (watchdog disable, unplug) or newly appeared.
async fn supervise(
    tx: mpsc::Sender<ControlEvent>,
    combo: KeyCombo,
    suppress: bool,
    cancel: CancellationToken,
) {
    let mut monitored: HashMap<PathBuf, tokio::task::JoinHandle<()>> = HashMap::new();

    loop {
        monitored.retain(|_, handle| !handle.is_finished());

        for (path, device) in find_keyboards() {
            if monitored.contains_key(&path) {
                continue;
            }
            let handle = tokio::spawn(monitor_device(
                path.clone(),
                device,
                combo.clone(),
                suppress,
                tx.clone(),
                cancel.clone(),
            ));
            monitored.insert(path, handle);
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                for handle in monitored.into_values() {
                    handle.abort();
                }
                break;
            }
            _ = tokio::time::sleep(RESCAN_INTERVAL) => {}
        }
    }

    log::debug!("Combo supervisor exiting");
}

/// Run the tracker over one device's event stream until the device errors
/// out or the monitor is cancelled.
async fn monitor_device(
    path: PathBuf,
    mut device: Device,
    combo: KeyCombo,
    suppress: bool,
    tx: mpsc::Sender<ControlEvent>,
    cancel: CancellationToken,
) {
    let name = device.name().unwrap_or("Unknown").to_string();
    log::info!("Monitoring keyboard: {:?} ({})", path, name);

    let mut passthrough = None;
    if suppress && combo.key.is_some() {
        match grab_with_passthrough(&mut device) {
            Ok(virt) => passthrough = Some(virt),
            Err(e) => log::warn!(
                "Cannot suppress combo keys on {} ({}); detection only",
                name,
                e
            ),
        }
    }

    let mut tracker = ComboTracker::new(combo);

    let mut stream = match device.into_event_stream() {
        Ok(s) => s,
        Err(e) => {
            log::warn!("Failed to open event stream for {:?}: {}", path, e);
            return;
        }
    };

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            result = stream.next_event() => {
                match result {
                    Ok(ev) => {
                        let (edge, verdict) = match ev.kind() {
                            InputEventKind::Key(key) => tracker.process(key, ev.value()),
                            _ => (None, KeyVerdict::Forward),
                        };

                        if let Some(virt) = passthrough.as_mut() {
                            if verdict == KeyVerdict::Forward {
                                if let Err(e) = virt.emit(&[ev]) {
                                    log::warn!("Passthrough emit failed on {}: {}", name, e);
                                }
                            }
                        }

                        let sent = match edge {
                            Some(ComboEdge::Engaged) => {
                                log::info!("Combo engaged ({})", name);
                                tx.send(ControlEvent::ComboEngaged).await
                            }
                            Some(ComboEdge::Released) => {
                                log::info!("Combo released ({})", name);
                                tx.send(ControlEvent::ComboReleased).await
                            }
                            None => Ok(()),
                        };
                        if sent.is_err() {
                            log::debug!("Control channel closed; stopping {}", name);
                            return;
                        }
                    }
                    Err(e) => {
                        log::warn!(
                            "Device read error for {:?} (re-attaching shortly): {}",
                            path,
                            e
                        );
                        break;
                    }
                }
            }
        }
    }

    // The device died mid-hold: close the session rather than leaving it
    // recording forever.
    if tracker.is_engaged() {
        let _ = tx.send(ControlEvent::ComboReleased).await;
    }

    log::info!("Stopped monitoring {:?}", path);
}

/// Grab the device exclusively and build the virtual device that forwarded
/// events are re-emitted through.
fn grab_with_passthrough(device: &mut Device) -> Result<VirtualDevice, String> {
    let mut builder = VirtualDeviceBuilder::new()
        .map_err(|e| format!("uinput unavailable: {}", e))?
        .name("talkey passthrough");
    if let Some(keys) = device.supported_keys() {
        builder = builder
            .with_keys(keys)
            .map_err(|e| format!("virtual device keys: {}", e))?;
    }
    let virt = builder
        .build()
        .map_err(|e| format!("virtual device build: {}", e))?;

    device
        .grab()
        .map_err(|e| format!("exclusive grab: {}", e))?;

    Ok(virt)
}
