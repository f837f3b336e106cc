//! The naming engine: the single source of truth for asset names
//!
//! Every asset name dsr produces or expects comes through here. A name is
//! rendered from a template over a closed variable set, then the archive
//! extension is appended. Two templates are in play per tool: the primary
//! (versioned) one and the install-script (compat) one, and the pair they
//! render is a [`DualName`][].

use std::fmt;

use serde::Serialize;

use crate::errors::{DsrError, DsrResult};
use crate::platform::{ArchiveFormat, Os};

/// The default versioned template
pub const DEFAULT_TEMPLATE: &str = "${name}-${version}-${os}-${arch}";
/// The default compat (install-script) template
pub const DEFAULT_COMPAT_TEMPLATE: &str = "${name}-${os}-${arch}";

/// A variable a template may reference
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Var {
    /// The tool name
    Name,
    /// The version with any leading `v` stripped
    Version,
    /// The os token
    Os,
    /// The arch token
    Arch,
    /// Shorthand for `${os}-${arch}`
    Target,
    /// The optional triple axis; renders empty when the target has none
    TargetTriple,
}

impl Var {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "name" => Some(Var::Name),
            "version" => Some(Var::Version),
            "os" => Some(Var::Os),
            "arch" => Some(Var::Arch),
            "target" => Some(Var::Target),
            "target_triple" => Some(Var::TargetTriple),
            _ => None,
        }
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Var::Name => "name",
            Var::Version => "version",
            Var::Os => "os",
            Var::Arch => "arch",
            Var::Target => "target",
            Var::TargetTriple => "target_triple",
        };
        write!(f, "${{{name}}}")
    }
}

/// One piece of a parsed template
#[derive(Debug, Clone, PartialEq, Eq)]
enum Chunk {
    Lit(String),
    Var(Var),
}

/// A parsed naming template
///
/// Parsing up front (rather than substituting strings at render time) means
/// an unknown variable is a config error once, not a bad filename later.
#[derive(Debug, Clone)]
pub struct Template {
    raw: String,
    chunks: Vec<Chunk>,
}

impl Template {
    /// Parse a template, rejecting unknown variables and unclosed `${`
    pub fn parse(raw: &str) -> DsrResult<Self> {
        let mut chunks = Vec::new();
        let mut lit = String::new();
        let mut rest = raw;
        while let Some(start) = rest.find("${") {
            lit.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                return Err(DsrError::TemplateInvalid {
                    template: raw.to_owned(),
                    reason: "unclosed ${".to_owned(),
                });
            };
            let var_name = &after[..end];
            let Some(var) = Var::from_name(var_name) else {
                return Err(DsrError::TemplateInvalid {
                    template: raw.to_owned(),
                    reason: format!("unknown variable ${{{var_name}}}"),
                });
            };
            if !lit.is_empty() {
                chunks.push(Chunk::Lit(std::mem::take(&mut lit)));
            }
            chunks.push(Chunk::Var(var));
            rest = &after[end + 1..];
        }
        lit.push_str(rest);
        if !lit.is_empty() {
            chunks.push(Chunk::Lit(lit));
        }
        if chunks.is_empty() {
            return Err(DsrError::TemplateInvalid {
                template: raw.to_owned(),
                reason: "template is empty".to_owned(),
            });
        }
        Ok(Self {
            raw: raw.to_owned(),
            chunks,
        })
    }

    /// The template text as written
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Whether the template references a variable (directly or via `${target}`)
    pub fn uses(&self, var: Var) -> bool {
        self.chunks.iter().any(|c| match c {
            Chunk::Var(v) => {
                *v == var || (*v == Var::Target && matches!(var, Var::Os | Var::Arch))
            }
            Chunk::Lit(_) => false,
        })
    }

    /// The literal separator between the first two variables, if any
    fn separator(&self) -> Option<&str> {
        let mut seen_var = false;
        for chunk in &self.chunks {
            match chunk {
                Chunk::Var(_) => seen_var = true,
                Chunk::Lit(lit) if seen_var => return Some(lit),
                Chunk::Lit(_) => {}
            }
        }
        None
    }

    fn render(&self, ctx: &NameContext<'_>) -> String {
        let mut out = String::new();
        for chunk in &self.chunks {
            match chunk {
                Chunk::Lit(lit) => out.push_str(lit),
                Chunk::Var(Var::Name) => out.push_str(ctx.name),
                Chunk::Var(Var::Version) => out.push_str(ctx.version),
                Chunk::Var(Var::Os) => out.push_str(ctx.os.as_str()),
                Chunk::Var(Var::Arch) => out.push_str(ctx.arch),
                Chunk::Var(Var::Target) => {
                    out.push_str(ctx.os.as_str());
                    out.push('-');
                    out.push_str(ctx.arch);
                }
                Chunk::Var(Var::TargetTriple) => {
                    if let Some(triple) = ctx.target_triple {
                        out.push_str(triple);
                    }
                }
            }
        }
        out
    }
}

/// The inputs a name is rendered from
#[derive(Debug, Clone)]
pub struct NameContext<'a> {
    /// The tool name
    pub name: &'a str,
    /// The version, already stripped of any leading `v`
    pub version: &'a str,
    /// The os
    pub os: Os,
    /// The arch token
    pub arch: &'a str,
    /// The optional triple axis
    pub target_triple: Option<&'a str>,
}

/// The (versioned, compat) pair of names for one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DualName {
    /// The primary, versioned asset name
    pub versioned: String,
    /// The legacy name install scripts hard-code
    pub compat: String,
    /// Whether the two resolved to the same string
    pub same: bool,
}

/// Strip a single leading `v` from a version, the filename convention
pub fn clean_version(version: &str) -> &str {
    version.strip_prefix('v').unwrap_or(version)
}

/// Expand the dual name for one target
///
/// The extension is appended outside the template: `.{ext}` for archives,
/// nothing for raw binaries except `.exe` on windows.
pub fn expand(
    ctx: &NameContext<'_>,
    format: ArchiveFormat,
    template: &Template,
    compat_template: &Template,
) -> DualName {
    let suffix = match format {
        ArchiveFormat::Binary => ctx.os.exe_suffix().to_owned(),
        other => format!(".{}", other.ext()),
    };
    let versioned = format!("{}{}", template.render(ctx), suffix);
    let compat = format!("{}{}", compat_template.render(ctx), suffix);
    let same = versioned == compat;
    DualName {
        versioned,
        compat,
        same,
    }
}

/// How two templates disagree
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TemplateMismatch {
    /// The templates join their variables with different separators
    SeparatorMismatch {
        /// Separator in the config template
        config: String,
        /// Separator in the other template
        other: String,
    },
    /// One template carries `${version}` and the other doesn't
    VersionTokenMismatch {
        /// Whether the config template has the version token
        config_has_version: bool,
    },
    /// One template carries `${name}` and the other doesn't
    NameTokenMismatch {
        /// Whether the config template has the name token
        config_has_name: bool,
    },
}

/// The advisory report from template validation
#[derive(Debug, Clone, Serialize)]
pub struct TemplateReport {
    /// `ok` when nothing diverges, `warning` otherwise
    pub status: String,
    /// Every divergence found
    pub mismatches: Vec<TemplateMismatch>,
    /// Concrete suggestions; one per mismatch
    pub recommendations: Vec<String>,
}

impl TemplateReport {
    /// Whether the report found nothing to warn about
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

fn compare(config: &Template, other: &Template, other_label: &str, report: &mut TemplateReport) {
    let config_sep = config.separator().unwrap_or("-").to_owned();
    let other_sep = other.separator().unwrap_or("-").to_owned();
    if config_sep != other_sep {
        report.mismatches.push(TemplateMismatch::SeparatorMismatch {
            config: config_sep.clone(),
            other: other_sep.clone(),
        });
        report.recommendations.push(format!(
            "the {other_label} template separates tokens with '{other_sep}' while the config template uses '{config_sep}'; pick one so installers and releases agree"
        ));
    }
    let config_version = config.uses(Var::Version);
    if config_version != other.uses(Var::Version) {
        report
            .mismatches
            .push(TemplateMismatch::VersionTokenMismatch {
                config_has_version: config_version,
            });
        let (with, without) = if config_version {
            ("config", other_label)
        } else {
            (other_label, "config")
        };
        report.recommendations.push(format!(
            "the {with} template embeds ${{version}} but the {without} template does not; version-less names overwrite each other across releases"
        ));
    }
    let config_name = config.uses(Var::Name);
    if config_name != other.uses(Var::Name) {
        report.mismatches.push(TemplateMismatch::NameTokenMismatch {
            config_has_name: config_name,
        });
        report.recommendations.push(format!(
            "only one of the config and {other_label} templates embeds ${{name}}; assets from different tools will collide without it"
        ));
    }
}

/// Pull template-looking tokens out of an upstream workflow file
///
/// Anything whitespace-separated that references `${name}` and parses
/// against the closed variable set counts; everything else is ignored.
pub fn scrape_templates(text: &str) -> Vec<Template> {
    text.split_whitespace()
        .filter(|token| token.contains("${name}"))
        .filter_map(|token| {
            let trimmed = token.trim_matches(|c: char| matches!(c, '"' | '\'' | ',' | ':'));
            Template::parse(trimmed).ok()
        })
        .collect()
}

/// Validate the config template against the installer template and any
/// templates scraped from the upstream workflow
///
/// Always advisory: a warning here never fails a build.
pub fn validate_templates(
    config: &Template,
    installer: &Template,
    workflow: &[Template],
) -> TemplateReport {
    let mut report = TemplateReport {
        status: "ok".to_owned(),
        mismatches: Vec::new(),
        recommendations: Vec::new(),
    };
    compare(config, installer, "install-script", &mut report);
    for tpl in workflow {
        compare(config, tpl, "workflow", &mut report);
    }
    if !report.mismatches.is_empty() {
        report.status = "warning".to_owned();
    }
    report
}
