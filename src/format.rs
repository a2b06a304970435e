use anyhow::Result;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Table};
use serde::Serialize;

use crate::schema::{SystemProperties, SystemSummary, Version};
use crate::session::Session;

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(header);
    table
}

pub fn system_table(systems: &[SystemSummary]) -> Table {
    let mut table = new_table(vec!["ID", "NAME", "TYPE", "OWNER", "STATE"]);
    for system in systems {
        table.add_row(vec![
            system.id.clone(),
            system.name.clone(),
            system.system_type.clone(),
            system.owner.clone(),
            system.state.clone(),
        ]);
    }
    table
}

pub fn print_system_list(systems: &[SystemSummary]) {
    if systems.is_empty() {
        println!("No compute systems found.");
        return;
    }
    println!("{}", system_table(systems));
}

/// Sessions the shell has open; the default one is starred.
pub fn session_table<'a>(sessions: impl Iterator<Item = &'a Session>, default: Option<&str>) -> Table {
    let mut table = new_table(vec!["", "ID", "ORIGIN", "OPENED"]);
    for session in sessions {
        let marker = if Some(session.id()) == default { "*" } else { "" };
        table.add_row(vec![
            marker.to_string(),
            session.id().to_string(),
            session.origin().to_string(),
            session.opened_at().format("%Y-%m-%d %H:%M:%S").to_string(),
        ]);
    }
    table
}

pub fn print_properties(props: &SystemProperties) {
    let responses = &props.property_responses;
    println!("State:      {}", responses.basic.response.state);
    println!("RuntimeID:  {}", responses.basic.response.runtime_id);
    if let Some(version) = &responses.vm_version {
        println!("VmVersion:  {}", version.response);
    }
}

pub fn format_versions(versions: &[Version]) -> String {
    versions.iter().map(Version::to_string).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_table_rows() {
        let systems = vec![SystemSummary {
            id: "vm1".to_string(),
            name: "vm1".to_string(),
            system_type: "VirtualMachine".to_string(),
            owner: "hcstool".to_string(),
            state: "Running".to_string(),
        }];

        let rendered = system_table(&systems).to_string();
        assert!(rendered.contains("OWNER"));
        assert!(rendered.contains("VirtualMachine"));
        assert!(rendered.contains("Running"));
    }

    #[test]
    fn test_format_versions() {
        let versions = [Version { major: 1, minor: 0 }, Version { major: 2, minor: 5 }];
        assert_eq!(format_versions(&versions), "1.0, 2.5");
        assert_eq!(format_versions(&[]), "");
    }
}
