//! Serial port listing.

use {
    anyhow::Result,
    console::style,
    dutbench::detect_ports,
};

/// List ports with the resource id and platform allocation would use.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let detected = detect_ports();

    if json {
        let ports: Vec<serde_json::Value> = detected
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "bridge": p.bridge.name(),
                    "resource_id": p.resource_id(),
                    "platform": p.platform(),
                    "vid": p.vid,
                    "pid": p.pid,
                    "manufacturer": p.manufacturer,
                    "product": p.product,
                    "serial": p.serial,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }

    eprintln!("{}", style("Available serial ports").bold().underlined());

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for port in &detected {
        let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" ({vid:04X}:{pid:04X})")
        } else {
            String::new()
        };
        eprintln!(
            "  {} {} [{}]{} - {} {}",
            style("•").green(),
            style(&port.name).cyan(),
            style(port.bridge.name()).yellow(),
            vid_pid,
            port.platform(),
            style(format!("id={}", port.resource_id())).dim()
        );
    }
    Ok(())
}
