//! Macro rendering and simulation command lines for generation jobs.
//!
//! Templates use `{NAME}` placeholders. The recognised names are
//! `GENERATOR`, `CONFINEMENT`, `N_EVENTS`, `SEED`, `VERTICES_FILE` and any key
//! of the definition's `macro_substitutions` block.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::catalog::{MacroSnippet, MacroTables, ResolvedCatalog, SimulationDefinition};
use crate::config::SimflowConfig;
use crate::dag::Job;
use crate::error::{Result, SimflowError};
use crate::fingerprint::DEFINES_PREFIX;
use crate::patterns::PathEngine;
use crate::persist::write_atomic;
use crate::tier::ArtifactKind;

const CONFINE_VOLUME: &str = "/RMG/Generator/Confine Volume";
const ADD_VOLUME: &str = "/RMG/Generator/Confinement/Physical/AddVolume";
const SAMPLE_ON_SURFACE: &str = "/RMG/Generator/Confinement/SampleOnSurface true";
const BULK_PREFIX: &str = "~volumes.bulk:";
const SURFACE_PREFIX: &str = "~volumes.surface:";

/// Default simulation executable.
pub const DEFAULT_EXECUTABLE: &str = "remage";

fn render_error(def: &SimulationDefinition, reason: impl Into<String>) -> SimflowError {
    SimflowError::MacroRender {
        tier: def.tier,
        simid: def.simid.clone(),
        reason: reason.into(),
    }
}

fn lookup_define(
    def: &SimulationDefinition,
    table: &BTreeMap<String, MacroSnippet>,
    field: &str,
    reference: &str,
) -> Result<String> {
    let key = reference.strip_prefix(DEFINES_PREFIX).ok_or_else(|| {
        render_error(def, format!("'{field}' must be a string prefixed by {DEFINES_PREFIX}"))
    })?;
    table
        .get(key)
        .map(|snippet| snippet.render())
        .ok_or_else(|| render_error(def, format!("{field} '{key}' is not defined")))
}

fn volume_lines(directive: &str) -> Option<Vec<String>> {
    if let Some(volume) = directive.strip_prefix(BULK_PREFIX) {
        Some(vec![format!("{ADD_VOLUME} {volume}")])
    } else {
        directive.strip_prefix(SURFACE_PREFIX).map(|volume| {
            vec![
                format!("{ADD_VOLUME} {volume}"),
                SAMPLE_ON_SURFACE.to_string(),
            ]
        })
    }
}

fn confinement(def: &SimulationDefinition, tables: &MacroTables, value: &Value) -> Result<String> {
    const EXPECTED: &str =
        "'confinement' must be a string or list prefixed by ~defines: / ~volumes.surface: / ~volumes.bulk:";
    match value {
        Value::String(s) if s.starts_with(DEFINES_PREFIX) => {
            lookup_define(def, &tables.confinement, "confinement", s)
        }
        Value::String(s) => {
            let lines = volume_lines(s).ok_or_else(|| render_error(def, EXPECTED))?;
            Ok(std::iter::once(CONFINE_VOLUME.to_string())
                .chain(lines)
                .collect::<Vec<_>>()
                .join("\n"))
        }
        Value::Array(items) if !items.is_empty() => {
            let mut lines = vec![CONFINE_VOLUME.to_string()];
            for item in items {
                let directive = item.as_str().ok_or_else(|| render_error(def, EXPECTED))?;
                lines.extend(volume_lines(directive).ok_or_else(|| render_error(def, EXPECTED))?);
            }
            Ok(lines.join("\n"))
        }
        _ => Err(render_error(def, EXPECTED)),
    }
}

/// Substitutions that depend only on the definition.
pub fn macro_substitutions(
    def: &SimulationDefinition,
    tables: &MacroTables,
) -> Result<BTreeMap<String, String>> {
    let mut subs = BTreeMap::new();

    if let Some(generator) = def.field("generator") {
        let reference = generator.as_str().ok_or_else(|| {
            render_error(def, format!("'generator' must be a string prefixed by {DEFINES_PREFIX}"))
        })?;
        subs.insert(
            "GENERATOR".to_string(),
            lookup_define(def, &tables.generators, "generator", reference)?,
        );
    }
    if let Some(value) = def.field("confinement") {
        subs.insert("CONFINEMENT".to_string(), confinement(def, tables, value)?);
    }
    match def.field("macro_substitutions") {
        None => {}
        Some(Value::Object(extra)) => {
            for (key, value) in extra {
                let text = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                subs.insert(key.clone(), text);
            }
        }
        Some(_) => return Err(render_error(def, "'macro_substitutions' must be a mapping")),
    }
    Ok(subs)
}

/// Deterministic per-job seed in `[0, 2^31)`.
pub fn derive_seed(fingerprint: &str, job_index: usize) -> u32 {
    let digest = Sha256::new()
        .chain_update(fingerprint.as_bytes())
        .chain_update(b":")
        .chain_update(job_index.to_string().as_bytes())
        .finalize();
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) & 0x7fff_ffff
}

/// First `{NAME}` placeholder left in `text`.
fn leftover_placeholder(text: &str) -> Option<&str> {
    let mut rest = text;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        let close = after.find('}')?;
        let name = &after[..close];
        if !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
        {
            return Some(name);
        }
        rest = after;
    }
    None
}

/// Render the macro of `job` from `template`.
pub fn render_macro(
    def: &SimulationDefinition,
    tables: &MacroTables,
    template: &str,
    job: &Job,
) -> Result<String> {
    let mut subs = macro_substitutions(def, tables)?;
    if let Some(n) = def.primaries_per_job {
        subs.insert("N_EVENTS".to_string(), n.to_string());
    }
    subs.insert(
        "SEED".to_string(),
        derive_seed(&job.fingerprint, job.job_index).to_string(),
    );
    if def.vertices.is_some() {
        let vertices = job
            .inputs
            .iter()
            .find(|p| {
                p.extension().and_then(|e| e.to_str()) == Some(ArtifactKind::Output.extension())
            })
            .ok_or_else(|| render_error(def, "job declares no vertices input"))?;
        subs.insert("VERTICES_FILE".to_string(), vertices.display().to_string());
    }

    let mut text = template.trim().to_string();
    for (name, value) in &subs {
        text = text.replace(&format!("{{{name}}}"), value);
    }
    if let Some(name) = leftover_placeholder(&text) {
        return Err(render_error(def, format!("no value for placeholder {{{name}}}")));
    }
    text.push('\n');
    Ok(text)
}

/// Location of a definition's template file.
pub fn template_path(config: &SimflowConfig, def: &SimulationDefinition) -> PathBuf {
    let template = Path::new(&def.template);
    match &config.paths.templates {
        Some(dir) if template.is_relative() => dir.join(template),
        _ => template.to_path_buf(),
    }
}

/// Render `job`'s macro and write it to its canonical path.
pub fn write_macro(
    config: &SimflowConfig,
    catalog: &ResolvedCatalog,
    job: &Job,
) -> Result<PathBuf> {
    let path = job
        .macro_path
        .clone()
        .ok_or_else(|| SimflowError::ArtifactNotApplicable {
            tier: job.tier,
            kind: ArtifactKind::Macro.to_string(),
        })?;
    let def = catalog.require(job.tier, &job.simid)?;
    let tables = catalog.tables(job.tier).cloned().unwrap_or_default();
    let template = fs::read_to_string(template_path(config, def))?;
    let text = render_macro(def, &tables, &template, job)?;
    write_atomic(&path, text.as_bytes())?;
    Ok(path)
}

/// Argument vector running the simulation executable for `job`.
pub fn simulation_command(config: &SimflowConfig, job: &Job) -> Result<Vec<String>> {
    let macro_path = job
        .macro_path
        .as_ref()
        .ok_or_else(|| SimflowError::ArtifactNotApplicable {
            tier: job.tier,
            kind: ArtifactKind::Macro.to_string(),
        })?;
    let executable = config
        .runcmd
        .remage
        .as_deref()
        .unwrap_or(DEFAULT_EXECUTABLE);
    let mut argv: Vec<String> = executable.split_whitespace().map(str::to_string).collect();
    if argv.is_empty() {
        return Err(SimflowError::InvalidConfig(
            "runcmd.remage must name an executable".to_string(),
        ));
    }
    argv.extend([
        "--threads".to_string(),
        config.runcmd.threads.to_string(),
        "--gdml-files".to_string(),
        PathEngine::new(config).geom_file().display().to_string(),
        "--output-file".to_string(),
        job.output.display().to_string(),
        "--".to_string(),
        macro_path.display().to_string(),
    ]);
    Ok(argv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, CatalogDocument};
    use crate::dag::expand;
    use crate::fingerprint::StructuralInputs;
    use crate::selector::Selection;
    use crate::tier::Tier;
    use serde_json::json;

    const TEMPLATE: &str = "/run/initialize\n{GENERATOR}\n{CONFINEMENT}\n/random/setSeeds {SEED} {SEED}\n/run/beamOn {N_EVENTS}\n";

    fn setup(stp: Value) -> (SimflowConfig, ResolvedCatalog) {
        let config = SimflowConfig::new("l200a", "/prod").unwrap();
        let doc = CatalogDocument::from_value(
            "test",
            json!({
                "ver": { "simulations": {
                    "v": { "template": "ver.mac", "number_of_jobs": 1,
                           "generator": "~defines:U", "confinement": "~volumes.bulk:hpge.*" }
                }, "generators": { "U": "/gps/ion 92 238" } },
                "stp": {
                    "generators": { "K40": ["/gps/particle ion", "/gps/ion 19 40"] },
                    "confinement": { "birds-nest": "/RMG/Generator/Confine Volume\n/RMG/Generator/Confinement/Physical/AddVolume bn" },
                    "simulations": { "x": stp }
                }
            }),
        )
        .unwrap();
        let catalog = Catalog::new().with_document(doc).resolve(&config, &[]).unwrap();
        (config, catalog)
    }

    fn first_job(config: &SimflowConfig, catalog: &ResolvedCatalog, tier: Tier) -> Job {
        let plan = expand(catalog, config, &Selection::Everything, &StructuralInputs::new()).unwrap();
        let job = plan.jobs_of(tier).next().unwrap().clone();
        job
    }

    fn render(stp: Value) -> Result<String> {
        let (config, catalog) = setup(stp);
        let job = first_job(&config, &catalog, Tier::Stp);
        let def = catalog.require(Tier::Stp, "x").unwrap();
        render_macro(def, catalog.tables(Tier::Stp).unwrap(), TEMPLATE, &job)
    }

    #[test]
    fn test_defines_substitution() {
        let text = render(json!({
            "template": "stp.mac", "number_of_jobs": 1, "primaries_per_job": 500,
            "generator": "~defines:K40", "confinement": "~defines:birds-nest"
        }))
        .unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines.contains(&"/gps/ion 19 40"));
        assert!(lines.contains(&"/RMG/Generator/Confinement/Physical/AddVolume bn"));
        assert!(lines.contains(&"/run/beamOn 500"));
    }

    #[test]
    fn test_volume_directives() {
        let text = render(json!({
            "template": "stp.mac", "number_of_jobs": 1, "primaries_per_job": 1,
            "generator": "~defines:K40",
            "confinement": ["~volumes.surface:phbr_spring.*", "~volumes.bulk:phbr_washer.*"]
        }))
        .unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines.contains(&CONFINE_VOLUME));
        assert!(lines.contains(&"/RMG/Generator/Confinement/Physical/AddVolume phbr_spring.*"));
        assert!(lines.contains(&"/RMG/Generator/Confinement/Physical/AddVolume phbr_washer.*"));
        assert!(lines.contains(&SAMPLE_ON_SURFACE));
    }

    #[test]
    fn test_bulk_has_no_surface_sampling() {
        let text = render(json!({
            "template": "stp.mac", "number_of_jobs": 1, "primaries_per_job": 1,
            "generator": "~defines:K40", "confinement": "~volumes.bulk:pen.*"
        }))
        .unwrap();
        assert!(text.contains("AddVolume pen.*"));
        assert!(!text.contains("SampleOnSurface"));
    }

    #[test]
    fn test_bad_references() {
        for (generator, confinement) in [
            ("coddue", "~defines:birds-nest"),
            ("~defines:boh", "~defines:birds-nest"),
            ("~defines:K40", "~baaaaaa:beh"),
            ("~defines:K40", "~defines:beh"),
        ] {
            let result = render(json!({
                "template": "stp.mac", "number_of_jobs": 1, "primaries_per_job": 1,
                "generator": generator, "confinement": confinement
            }));
            assert!(
                matches!(result, Err(SimflowError::MacroRender { .. })),
                "accepted {generator} / {confinement}"
            );
        }
    }

    #[test]
    fn test_missing_value_is_error() {
        let result = render(json!({
            "template": "stp.mac", "number_of_jobs": 1,
            "generator": "~defines:K40", "confinement": "~defines:birds-nest"
        }));
        let err = result.unwrap_err().to_string();
        assert!(err.contains("{N_EVENTS}"), "{err}");
    }

    #[test]
    fn test_user_substitutions() {
        let (config, catalog) = setup(json!({
            "template": "stp.mac", "number_of_jobs": 1,
            "macro_substitutions": { "ENERGY": 2615, "UNIT": "keV" }
        }));
        let job = first_job(&config, &catalog, Tier::Stp);
        let def = catalog.require(Tier::Stp, "x").unwrap();
        let text = render_macro(
            def,
            catalog.tables(Tier::Stp).unwrap(),
            "/gps/energy {ENERGY} {UNIT}",
            &job,
        )
        .unwrap();
        assert_eq!(text, "/gps/energy 2615 keV\n");
    }

    #[test]
    fn test_seed_is_deterministic_per_job() {
        assert_eq!(derive_seed("abc", 0), derive_seed("abc", 0));
        assert_ne!(derive_seed("abc", 0), derive_seed("abc", 1));
        assert_ne!(derive_seed("abc", 0), derive_seed("abd", 0));
        assert!(derive_seed("abc", 0) < 1 << 31);
    }

    #[test]
    fn test_simulation_command() {
        let (mut config, catalog) = setup(json!({ "template": "stp.mac", "number_of_jobs": 1 }));
        config.runcmd.remage = Some("apptainer run remage.sif remage".to_string());
        config.runcmd.threads = 4;
        let job = first_job(&config, &catalog, Tier::Stp);
        let argv = simulation_command(&config, &job).unwrap();
        assert_eq!(&argv[..4], ["apptainer", "run", "remage.sif", "remage"]);
        assert_eq!(argv[5], "4");
        assert_eq!(argv[7], "/prod/generated/geom/l200a-geom.gdml");
        assert_eq!(argv.last().map(String::as_str), job.macro_path.as_ref().and_then(|p| p.to_str()));

        let hit = first_job(&config, &catalog, Tier::Hit);
        assert!(matches!(
            simulation_command(&config, &hit),
            Err(SimflowError::ArtifactNotApplicable { .. })
        ));
    }

    #[test]
    fn test_write_macro_to_canonical_path() {
        let dir = tempfile::tempdir().unwrap();
        let (mut config, catalog) = setup(json!({
            "template": "stp.mac", "number_of_jobs": 1, "primaries_per_job": 10,
            "generator": "~defines:K40", "confinement": "~defines:birds-nest"
        }));
        config.paths = crate::config::PathsConfig::under(dir.path());
        config.paths.templates = Some(dir.path().to_path_buf());
        fs::write(dir.path().join("stp.mac"), TEMPLATE).unwrap();

        let job = first_job(&config, &catalog, Tier::Stp);
        let path = write_macro(&config, &catalog, &job).unwrap();
        assert_eq!(Some(&path), job.macro_path.as_ref());
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("/run/beamOn 10"));
    }
}
