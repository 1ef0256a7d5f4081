use anyhow::{Context, Result};
use serde::Serialize;
use tera::Tera;

pub const CMDLINE: &str = "cmdline.txt";
pub const USERCFG: &str = "usercfg.txt";
pub const DECOMPRESS_KERNEL: &str = "auto_decompress_kernel";
pub const APT_HOOK: &str = "apt-decompress-hook";
pub const MODULES_LOAD: &str = "modules-load.conf";
pub const SYSCTL: &str = "sysctl.conf";
pub const CLOUD_INIT_NETWORK: &str = "cloud-init-network.cfg";
pub const FSTAB: &str = "fstab";

const EMBEDDED: &[(&str, &str)] = &[
    (CMDLINE, include_str!("../../templates/cmdline.txt.j2")),
    (USERCFG, include_str!("../../templates/usercfg.txt")),
    (
        DECOMPRESS_KERNEL,
        include_str!("../../templates/auto_decompress_kernel.sh"),
    ),
    (APT_HOOK, include_str!("../../templates/apt-decompress-hook.conf")),
    (MODULES_LOAD, include_str!("../../templates/modules-load.conf.j2")),
    (SYSCTL, include_str!("../../templates/sysctl.conf.j2")),
    (
        CLOUD_INIT_NETWORK,
        include_str!("../../templates/cloud-init-network.cfg"),
    ),
    (FSTAB, include_str!("../../templates/fstab.j2")),
];

/// Named guest configuration templates, compiled into the binary.
pub struct TemplateRepository {
    tera: Tera,
}

impl TemplateRepository {
    pub fn embedded() -> Result<Self> {
        let mut tera = Tera::default();
        tera.add_raw_templates(EMBEDDED.iter().copied())
            .context("failed to load embedded templates")?;
        debug!("loaded {} embedded templates", EMBEDDED.len());
        Ok(Self { tera })
    }

    /// Render template `name` against `data`.
    pub fn render<T: Serialize>(&self, name: &str, data: &T) -> Result<Vec<u8>> {
        let context = tera::Context::from_serialize(data)
            .with_context(|| format!("invalid data for template {name}"))?;
        let text = self
            .tera
            .render(name, &context)
            .with_context(|| format!("failed to render template {name}"))?;
        Ok(text.into_bytes())
    }

    /// Render a template that takes no data.
    pub fn render_static(&self, name: &str) -> Result<Vec<u8>> {
        self.render(name, &serde_json::json!({}))
    }
}
