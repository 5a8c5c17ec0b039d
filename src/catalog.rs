//! Fixed resource catalog: tiers, flavors, add-ons.
//!
//! The catalog is read-mostly and loaded once at startup. Ids are stable —
//! they feed image naming and billing, so renaming an entry is a breaking
//! change for existing sandboxes.

use serde::Serialize;

/// Fixed CPU/memory/storage allocation level a sandbox is provisioned at.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceTier {
    pub id: String,
    pub cpu_limit: u32,
    pub memory_mb: u64,
    pub storage_gb: u32,
    pub monthly_price: f64,
    pub is_default: bool,
    pub sort_order: u32,
}

/// Language/toolchain-specific base image selection.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerFlavor {
    pub id: String,
    pub languages: Vec<String>,
    pub base_image: String,
    pub is_default: bool,
    pub sort_order: u32,
}

/// Optional feature layered onto a flavor, with its own resource/port delta.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerAddon {
    pub id: String,
    pub image_suffix: String,
    pub extra_cpu: u32,
    pub extra_memory_mb: u64,
    pub extra_ports: Vec<u16>,
    /// Allow-list of flavors this add-on works with. Empty = any flavor.
    pub requires_flavor: Vec<String>,
    pub incompatible_with: Vec<String>,
    pub monthly_price: f64,
    pub sort_order: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Catalog {
    pub tiers: Vec<ResourceTier>,
    pub flavors: Vec<ContainerFlavor>,
    pub addons: Vec<ContainerAddon>,
}

impl Catalog {
    /// The built-in catalog shipped with the control plane.
    pub fn builtin() -> Self {
        Self {
            tiers: vec![
                ResourceTier {
                    id: "nano".into(),
                    cpu_limit: 1,
                    memory_mb: 2048,
                    storage_gb: 10,
                    monthly_price: 5.0,
                    is_default: false,
                    sort_order: 0,
                },
                ResourceTier {
                    id: "starter".into(),
                    cpu_limit: 2,
                    memory_mb: 4096,
                    storage_gb: 20,
                    monthly_price: 12.0,
                    is_default: true,
                    sort_order: 1,
                },
                ResourceTier {
                    id: "creator".into(),
                    cpu_limit: 4,
                    memory_mb: 8192,
                    storage_gb: 40,
                    monthly_price: 25.0,
                    is_default: false,
                    sort_order: 2,
                },
                ResourceTier {
                    id: "power".into(),
                    cpu_limit: 8,
                    memory_mb: 16384,
                    storage_gb: 80,
                    monthly_price: 50.0,
                    is_default: false,
                    sort_order: 3,
                },
            ],
            flavors: vec![
                ContainerFlavor {
                    id: "python".into(),
                    languages: vec!["python".into()],
                    base_image: "python".into(),
                    is_default: true,
                    sort_order: 0,
                },
                ContainerFlavor {
                    id: "node".into(),
                    languages: vec!["javascript".into(), "typescript".into()],
                    base_image: "node".into(),
                    is_default: false,
                    sort_order: 1,
                },
                ContainerFlavor {
                    id: "go".into(),
                    languages: vec!["go".into()],
                    base_image: "go".into(),
                    is_default: false,
                    sort_order: 2,
                },
                ContainerFlavor {
                    id: "polyglot".into(),
                    languages: vec![
                        "python".into(),
                        "javascript".into(),
                        "go".into(),
                        "rust".into(),
                    ],
                    base_image: "polyglot".into(),
                    is_default: false,
                    sort_order: 3,
                },
            ],
            addons: vec![
                ContainerAddon {
                    id: "code-server".into(),
                    image_suffix: "code-server".into(),
                    extra_cpu: 1,
                    extra_memory_mb: 2048,
                    extra_ports: vec![8443],
                    requires_flavor: vec![],
                    incompatible_with: vec!["gui".into()],
                    monthly_price: 5.0,
                    sort_order: 0,
                },
                ContainerAddon {
                    id: "gui".into(),
                    image_suffix: "gui".into(),
                    extra_cpu: 1,
                    extra_memory_mb: 1024,
                    extra_ports: vec![6080],
                    requires_flavor: vec![],
                    incompatible_with: vec!["code-server".into()],
                    monthly_price: 8.0,
                    sort_order: 1,
                },
                ContainerAddon {
                    id: "gpu".into(),
                    image_suffix: "gpu".into(),
                    extra_cpu: 0,
                    extra_memory_mb: 0,
                    extra_ports: vec![],
                    requires_flavor: vec![],
                    incompatible_with: vec![],
                    monthly_price: 40.0,
                    sort_order: 2,
                },
                ContainerAddon {
                    id: "jupyter".into(),
                    image_suffix: "jupyter".into(),
                    extra_cpu: 0,
                    extra_memory_mb: 1024,
                    extra_ports: vec![8888],
                    requires_flavor: vec!["python".into(), "polyglot".into()],
                    incompatible_with: vec![],
                    monthly_price: 3.0,
                    sort_order: 3,
                },
                ContainerAddon {
                    id: "db-clients".into(),
                    image_suffix: "db-clients".into(),
                    extra_cpu: 0,
                    extra_memory_mb: 512,
                    extra_ports: vec![],
                    requires_flavor: vec![],
                    incompatible_with: vec![],
                    monthly_price: 2.0,
                    sort_order: 4,
                },
            ],
        }
    }

    pub fn tier(&self, id: &str) -> Option<&ResourceTier> {
        self.tiers.iter().find(|t| t.id == id)
    }

    pub fn flavor(&self, id: &str) -> Option<&ContainerFlavor> {
        self.flavors.iter().find(|f| f.id == id)
    }

    pub fn addon(&self, id: &str) -> Option<&ContainerAddon> {
        self.addons.iter().find(|a| a.id == id)
    }

    pub fn default_tier(&self) -> &ResourceTier {
        self.tiers
            .iter()
            .find(|t| t.is_default)
            .unwrap_or(&self.tiers[0])
    }

    pub fn default_flavor(&self) -> &ContainerFlavor {
        self.flavors
            .iter()
            .find(|f| f.is_default)
            .unwrap_or(&self.flavors[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_has_defaults() {
        let cat = Catalog::builtin();
        assert_eq!(cat.default_tier().id, "starter");
        assert_eq!(cat.default_flavor().id, "python");
    }

    #[test]
    fn lookups_by_id() {
        let cat = Catalog::builtin();
        assert_eq!(cat.tier("creator").unwrap().cpu_limit, 4);
        assert_eq!(cat.tier("creator").unwrap().memory_mb, 8192);
        assert_eq!(cat.flavor("go").unwrap().base_image, "go");
        assert_eq!(cat.addon("code-server").unwrap().extra_cpu, 1);
        assert!(cat.tier("mega").is_none());
        assert!(cat.addon("nonexistent").is_none());
    }

    #[test]
    fn incompatibility_is_declared_both_ways() {
        let cat = Catalog::builtin();
        assert!(
            cat.addon("code-server")
                .unwrap()
                .incompatible_with
                .contains(&"gui".to_string())
        );
        assert!(
            cat.addon("gui")
                .unwrap()
                .incompatible_with
                .contains(&"code-server".to_string())
        );
    }

    #[test]
    fn jupyter_requires_python_family() {
        let cat = Catalog::builtin();
        let jupyter = cat.addon("jupyter").unwrap();
        assert_eq!(jupyter.requires_flavor, vec!["python", "polyglot"]);
    }

    #[test]
    fn tiers_ordered_by_capability() {
        let cat = Catalog::builtin();
        let cpus: Vec<u32> = cat.tiers.iter().map(|t| t.cpu_limit).collect();
        let mut sorted = cpus.clone();
        sorted.sort_unstable();
        assert_eq!(cpus, sorted);
    }
}
