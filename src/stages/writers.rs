/// Built-in writers
///
/// Writers are the sinks of a pipeline: the scheduler drains each one in turn and the
/// first writer in document order names the run's result reference.
use crate::pipeline::registry::ModuleRegistry;
use crate::pipeline::types::{Capability, DataType, ModuleDescriptor, ParamDef, StageParams};
use crate::runtime::payload::{Crs, PayloadItem};
use crate::runtime::stage::{factory, StageContext, StageImpl, WriteSummary, Writer};
use crate::runtime::stream::RecordStream;
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub(crate) fn register(registry: &ModuleRegistry, backend: &str) {
    registry.register(
        backend,
        ModuleDescriptor::new(
            "FeatureWriter",
            Capability::Writer,
            "Output",
            "Writes Features to a GeoJSON FeatureCollection or a GeoJSONL file.",
        )
        .param(ParamDef::new(
            "connectionString",
            DataType::Str,
            "Path of the output file ('.geojson', '.json', '.geojsonl', '.ndjson').",
        )),
        factory(|params| Ok(StageImpl::Writer(Box::new(FeatureWriter::from_params(params)?)))),
    );
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeatureWriterConfig {
    connection_string: String,
}

/// Output layout, picked from the file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Collection,
    Lines,
}

/// Writes vector features, and table rows as features without geometry.
///
/// Output goes to `<path>.partial` and is renamed into place once the input is fully
/// drained, so a failed run never leaves a truncated file at the target path.
#[derive(Debug)]
pub struct FeatureWriter {
    path: PathBuf,
}

impl FeatureWriter {
    fn from_params(params: &StageParams) -> Result<Self> {
        let config: FeatureWriterConfig = params.parse()?;
        Ok(Self {
            path: PathBuf::from(config.connection_string),
        })
    }

    fn format(&self) -> Result<OutputFormat> {
        let extension = self
            .path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        match extension.as_str() {
            "geojson" | "json" => Ok(OutputFormat::Collection),
            "geojsonl" | "ndjson" => Ok(OutputFormat::Lines),
            other => anyhow::bail!("unsupported output format '.{}' for {}", other, self.path.display()),
        }
    }

    /// Stream every item into `partial`, returning how many were written.
    ///
    /// The collection header carries the CRS of the first item, since the header has to
    /// be written before anything else is known.
    fn write_all(&self, format: OutputFormat, input: RecordStream, partial: &Path) -> Result<u64> {
        let file = File::create(partial).with_context(|| format!("Failed to create {}", partial.display()))?;
        let mut out = BufWriter::new(file);
        let mut written = 0u64;

        for item in input {
            let item = item?;
            let feature = feature_of(&item)?;

            match format {
                OutputFormat::Collection => {
                    if written == 0 {
                        write_header(&mut out, item.crs())?;
                    } else {
                        out.write_all(b",\n")?;
                    }
                    serde_json::to_writer(&mut out, &feature)?;
                }
                OutputFormat::Lines => {
                    serde_json::to_writer(&mut out, &feature)?;
                    out.write_all(b"\n")?;
                }
            }
            written += 1;
        }

        if format == OutputFormat::Collection {
            if written == 0 {
                write_header(&mut out, None)?;
            }
            out.write_all(b"\n]}\n")?;
        }
        out.flush()?;
        Ok(written)
    }
}

fn write_header(out: &mut impl Write, crs: Option<&Crs>) -> Result<()> {
    out.write_all(br#"{"type":"FeatureCollection","#)?;
    if let Some(crs) = crs {
        let member = json!({"type": "name", "properties": {"name": crs}});
        write!(out, r#""crs":{},"#, member)?;
    }
    out.write_all(br#""features":["#)?;
    out.write_all(b"\n")?;
    Ok(())
}

/// GeoJSON Feature of one item; rasters have no feature form
fn feature_of(item: &PayloadItem) -> Result<Value> {
    match item {
        PayloadItem::Vector(record) => Ok(record.to_feature()),
        PayloadItem::Table(row) => Ok(json!({
            "type": "Feature",
            "properties": row.fields,
            "geometry": null,
        })),
        PayloadItem::Raster(_) => anyhow::bail!("raster items cannot be written as features"),
    }
}

impl Writer for FeatureWriter {
    fn consume(&self, input: RecordStream, ctx: &StageContext) -> Result<WriteSummary> {
        let format = self.format()?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let mut partial = self.path.clone().into_os_string();
        partial.push(".partial");
        let partial = PathBuf::from(partial);

        match self.write_all(format, input, &partial) {
            Ok(items_written) => {
                fs::rename(&partial, &self.path)
                    .with_context(|| format!("Failed to move output into {}", self.path.display()))?;
                tracing::debug!("💾 '{}' wrote {} feature(s) to {}", ctx.stage_id, items_written, self.path.display());
                Ok(WriteSummary {
                    items_written,
                    artifact: Some(self.path.display().to_string()),
                })
            }
            Err(e) => {
                let _ = fs::remove_file(&partial);
                Err(e)
            }
        }
    }
}
