//! Serial port discovery

/// Port name that selects the built-in enclave emulator
pub const DUMMY_PORT: &str = "dummy";

/// Name fragments of USB CDC-ACM ports the PRG_USB cable shows up as
const PREFERRED: [&str; 2] = ["usbmodem", "ttyACM"];

/// Pick a likely SE-UART port from the system's serial ports
pub fn discover() -> Result<String, Box<dyn std::error::Error>> {
    let names: Vec<String> = serialport::available_ports()?
        .into_iter()
        .map(|info| info.port_name)
        .collect();
    log::debug!("Serial ports: {:?}", names);

    match select(names) {
        Some(port) => {
            log::info!("Using port {}", port);
            Ok(port)
        }
        None => Err("No serial port found. Is the PRG_USB cable connected?".into()),
    }
}

/// Prefer CDC-ACM ports, then fall back to whatever exists; lowest name wins
fn select(names: Vec<String>) -> Option<String> {
    let (mut preferred, mut others): (Vec<_>, Vec<_>) = names
        .into_iter()
        .partition(|name| PREFERRED.iter().any(|p| name.contains(p)));
    let candidates = if preferred.is_empty() {
        &mut others
    } else {
        &mut preferred
    };
    candidates.sort();
    if candidates.len() > 1 {
        log::info!(
            "Several candidate ports ({}), picking the first. Use --port to choose.",
            candidates.join(", ")
        );
    }
    candidates.first().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_select_prefers_acm() {
        let picked = select(names(&["/dev/ttyS0", "/dev/ttyACM1", "/dev/ttyACM0"]));
        assert_eq!(picked.as_deref(), Some("/dev/ttyACM0"));

        let picked = select(names(&["/dev/cu.Bluetooth", "/dev/cu.usbmodem0001"]));
        assert_eq!(picked.as_deref(), Some("/dev/cu.usbmodem0001"));
    }

    #[test]
    fn test_select_fallback() {
        assert_eq!(
            select(names(&["/dev/ttyS1", "/dev/ttyS0"])).as_deref(),
            Some("/dev/ttyS0")
        );
        assert_eq!(select(Vec::new()), None);
    }
}
