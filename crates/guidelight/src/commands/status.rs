//! `guidelight status`: one fallback read of the emergency state.

use guidelight_config::Config;
use guidelight_core::{CoreError, EmergencyState, HttpClient};

use crate::cli::{OutputFormat, StatusArgs};
use crate::error::CliError;

pub async fn handle(args: &StatusArgs, config: &Config) -> Result<(), CliError> {
    let sync = config.to_sync_config()?;
    let client = HttpClient::new(sync.http_url.clone(), &sync.transport).map_err(CoreError::from)?;
    let state = client.emergency_state().await.map_err(CoreError::from)?;

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&state)?),
        OutputFormat::Text => print!("{}", render(&state)),
    }
    Ok(())
}

fn render(state: &EmergencyState) -> String {
    if !state.is_activated {
        return "Emergency: inactive\n".into();
    }
    let mut out = String::from("Emergency: ACTIVE\n");
    out.push_str(&format!(
        "Zone:      {}\n",
        state.zone_name.as_deref().unwrap_or("(unnamed)")
    ));
    if let Some(ref wind) = state.wind_direction {
        out.push_str(&format!("Wind:      {wind}\n"));
    }
    if let Some(since) = state.activation_time {
        out.push_str(&format!("Since:     {}\n", since.format("%Y-%m-%d %H:%M:%S UTC")));
    }
    if state.deactivation_in_progress {
        out.push_str("Deactivation in progress\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;

    use super::*;

    #[test]
    fn renders_inactive() {
        assert_eq!(render(&EmergencyState::default()), "Emergency: inactive\n");
    }

    #[test]
    fn renders_active_zone() {
        let state = EmergencyState {
            is_activated: true,
            zone_name: Some("Zone A".into()),
            wind_direction: Some("N-S".into()),
            activation_time: DateTime::from_timestamp(1_772_359_200, 0),
            deactivation_in_progress: true,
            seq: None,
        };
        let text = render(&state);
        assert!(text.starts_with("Emergency: ACTIVE\n"));
        assert!(text.contains("Zone:      Zone A\n"));
        assert!(text.contains("Wind:      N-S\n"));
        assert!(text.contains("Since:     2026-03-01 10:00:00 UTC\n"));
        assert!(text.ends_with("Deactivation in progress\n"));
    }
}
