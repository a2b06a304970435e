use anyhow::{Context as _, Result};
use serde_json::Value;

use super::Context;
use crate::config::OutputFormat;
use crate::format;
use crate::schema::{ServiceProperties, ServicePropertyQuery};
use crate::HcsError;

pub fn execute(ctx: &Context) -> Result<ServiceProperties> {
    let query = serde_json::to_string(&ServicePropertyQuery::default())?;
    let document = ctx
        .engine
        .service_properties(&query)
        .map_err(HcsError::from)
        .context("Failed to query service properties")?;

    let props: ServiceProperties =
        serde_json::from_str(&document).context("Failed to parse service property document")?;

    match ctx.config.format {
        OutputFormat::Json => format::print_json(&serde_json::from_str::<Value>(&document)?)?,
        OutputFormat::Table => {
            let responses = &props.property_responses;
            println!(
                "Supported schema versions: {}",
                format::format_versions(&responses.basic.response.supported_schema_versions)
            );
            println!("ProcessorCapabilities:");
            println!("{}", serde_json::to_string_pretty(&responses.processor_capabilities.response)?);
        }
    }

    Ok(props)
}
