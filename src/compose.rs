//! Resource composer: (tier × flavor × add-ons) → image + limits.
//!
//! Pure and deterministic — no I/O. The image name sorts add-on suffixes
//! alphabetically so the same add-on set always yields the same name
//! regardless of input order; registry lookups and layer caching depend
//! on that. Invalid combinations are rejected here, before any provider
//! is contacted.

use std::collections::BTreeSet;

use crate::catalog::{ContainerAddon, ContainerFlavor, ResourceTier};
use crate::sandbox::error::SandboxError;
use crate::sandbox::types::{AGENT_RUNTIME_PORT, ComposedImageSpec};

/// Registry coordinates the composed image name is rooted at:
/// `{registry}/{owner}/{product}-{flavor}[-addon…]:{version}`.
#[derive(Debug, Clone)]
pub struct ImageCoordinates {
    pub registry: String,
    pub owner: String,
    pub product: String,
    pub version: String,
}

impl Default for ImageCoordinates {
    fn default() -> Self {
        Self {
            registry: "ghcr.io".into(),
            owner: "agentbox".into(),
            product: "sandbox".into(),
            version: "latest".into(),
        }
    }
}

/// Resolve a tier/flavor/add-on selection into a concrete image spec.
///
/// Add-on order in the input is irrelevant; duplicates are collapsed.
pub fn compose(
    coords: &ImageCoordinates,
    tier: &ResourceTier,
    flavor: &ContainerFlavor,
    addons: &[&ContainerAddon],
) -> Result<ComposedImageSpec, SandboxError> {
    check_compatibility(flavor, addons)?;

    // BTreeSet gives the alphabetical, deduplicated ordering the image
    // name invariant requires.
    let addon_ids: BTreeSet<&str> = addons.iter().map(|a| a.id.as_str()).collect();
    let sorted: Vec<&ContainerAddon> = addon_ids
        .iter()
        .filter_map(|id| addons.iter().find(|a| a.id == *id).copied())
        .collect();

    let mut image = format!(
        "{}/{}/{}-{}",
        coords.registry, coords.owner, coords.product, flavor.base_image
    );
    for addon in &sorted {
        image.push('-');
        image.push_str(&addon.image_suffix);
    }
    image.push(':');
    image.push_str(&coords.version);

    let cpu_limit = tier.cpu_limit + sorted.iter().map(|a| a.extra_cpu).sum::<u32>();
    let memory_mb = tier.memory_mb + sorted.iter().map(|a| a.extra_memory_mb).sum::<u64>();

    let mut ports: BTreeSet<u16> = BTreeSet::from([AGENT_RUNTIME_PORT]);
    for addon in &sorted {
        ports.extend(addon.extra_ports.iter().copied());
    }

    Ok(ComposedImageSpec {
        image,
        tier_id: tier.id.clone(),
        flavor_id: flavor.id.clone(),
        addon_ids: addon_ids.iter().map(|s| s.to_string()).collect(),
        cpu_limit,
        memory_mb,
        exposed_ports: ports.into_iter().collect(),
    })
}

/// Reject flavor allow-list violations and pairwise add-on conflicts.
fn check_compatibility(
    flavor: &ContainerFlavor,
    addons: &[&ContainerAddon],
) -> Result<(), SandboxError> {
    for addon in addons {
        if !addon.requires_flavor.is_empty() && !addon.requires_flavor.contains(&flavor.id) {
            return Err(SandboxError::IncompatibleComposition(format!(
                "addon '{}' requires flavor {}, got '{}'",
                addon.id,
                addon.requires_flavor.join(" or "),
                flavor.id
            )));
        }
    }

    for (i, a) in addons.iter().enumerate() {
        for b in addons.iter().skip(i + 1) {
            if a.incompatible_with.contains(&b.id) || b.incompatible_with.contains(&a.id) {
                return Err(SandboxError::IncompatibleComposition(format!(
                    "addons '{}' and '{}' cannot be combined",
                    a.id, b.id
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;

    fn coords() -> ImageCoordinates {
        ImageCoordinates::default()
    }

    #[test]
    fn image_name_invariant_under_permutation() {
        let cat = Catalog::builtin();
        let tier = cat.tier("starter").unwrap();
        let flavor = cat.flavor("python").unwrap();
        let gpu = cat.addon("gpu").unwrap();
        let cs = cat.addon("code-server").unwrap();
        let jup = cat.addon("jupyter").unwrap();

        let orderings: Vec<Vec<&crate::catalog::ContainerAddon>> = vec![
            vec![gpu, cs, jup],
            vec![jup, gpu, cs],
            vec![cs, jup, gpu],
            vec![jup, cs, gpu],
            vec![gpu, jup, cs],
            vec![cs, gpu, jup],
        ];

        let baseline = compose(&coords(), tier, flavor, &orderings[0]).unwrap();
        for ordering in &orderings[1..] {
            let spec = compose(&coords(), tier, flavor, ordering).unwrap();
            assert_eq!(spec, baseline);
        }
        assert_eq!(
            baseline.image,
            "ghcr.io/agentbox/sandbox-python-code-server-gpu-jupyter:latest"
        );
    }

    #[test]
    fn duplicate_addons_collapse() {
        let cat = Catalog::builtin();
        let tier = cat.tier("starter").unwrap();
        let flavor = cat.flavor("python").unwrap();
        let gpu = cat.addon("gpu").unwrap();

        let spec = compose(&coords(), tier, flavor, &[gpu, gpu]).unwrap();
        assert_eq!(spec.addon_ids, vec!["gpu"]);
        assert_eq!(spec.cpu_limit, tier.cpu_limit);
    }

    #[test]
    fn resources_are_additive_including_empty_set() {
        let cat = Catalog::builtin();
        let flavor = cat.flavor("python").unwrap();
        let cs = cat.addon("code-server").unwrap();
        let jup = cat.addon("jupyter").unwrap();

        for tier in &cat.tiers {
            let empty = compose(&coords(), tier, flavor, &[]).unwrap();
            assert_eq!(empty.cpu_limit, tier.cpu_limit);
            assert_eq!(empty.memory_mb, tier.memory_mb);

            let both = compose(&coords(), tier, flavor, &[cs, jup]).unwrap();
            assert_eq!(both.cpu_limit, tier.cpu_limit + cs.extra_cpu + jup.extra_cpu);
            assert_eq!(
                both.memory_mb,
                tier.memory_mb + cs.extra_memory_mb + jup.extra_memory_mb
            );
        }
    }

    #[test]
    fn empty_addon_set_still_exposes_agent_port() {
        let cat = Catalog::builtin();
        let spec = compose(
            &coords(),
            cat.tier("nano").unwrap(),
            cat.flavor("go").unwrap(),
            &[],
        )
        .unwrap();
        assert_eq!(spec.exposed_ports, vec![AGENT_RUNTIME_PORT]);
        assert_eq!(spec.image, "ghcr.io/agentbox/sandbox-go:latest");
    }

    #[test]
    fn addon_ports_union_with_agent_port() {
        let cat = Catalog::builtin();
        let spec = compose(
            &coords(),
            cat.tier("starter").unwrap(),
            cat.flavor("python").unwrap(),
            &[cat.addon("code-server").unwrap(), cat.addon("jupyter").unwrap()],
        )
        .unwrap();
        assert_eq!(spec.exposed_ports, vec![AGENT_RUNTIME_PORT, 8443, 8888]);
    }

    #[test]
    fn requires_flavor_rejected_for_wrong_flavor() {
        let cat = Catalog::builtin();
        let err = compose(
            &coords(),
            cat.tier("starter").unwrap(),
            cat.flavor("go").unwrap(),
            &[cat.addon("jupyter").unwrap()],
        )
        .unwrap_err();
        assert!(matches!(err, SandboxError::IncompatibleComposition(_)));

        // allowed on both members of the allow-list
        for flavor in ["python", "polyglot"] {
            compose(
                &coords(),
                cat.tier("starter").unwrap(),
                cat.flavor(flavor).unwrap(),
                &[cat.addon("jupyter").unwrap()],
            )
            .unwrap();
        }
    }

    #[test]
    fn incompatible_pair_rejected_in_either_order() {
        let cat = Catalog::builtin();
        let cs = cat.addon("code-server").unwrap();
        let gui = cat.addon("gui").unwrap();
        for pair in [[cs, gui], [gui, cs]] {
            let err = compose(
                &coords(),
                cat.tier("starter").unwrap(),
                cat.flavor("python").unwrap(),
                &pair,
            )
            .unwrap_err();
            assert!(matches!(err, SandboxError::IncompatibleComposition(_)));
        }
    }

    #[test]
    fn creator_python_gpu_code_server_scenario() {
        let cat = Catalog::builtin();
        let spec = compose(
            &coords(),
            cat.tier("creator").unwrap(),
            cat.flavor("python").unwrap(),
            &[cat.addon("gpu").unwrap(), cat.addon("code-server").unwrap()],
        )
        .unwrap();

        assert!(
            spec.image
                .trim_end_matches(":latest")
                .ends_with("-code-server-gpu")
        );
        assert_eq!(spec.cpu_limit, 5);
        assert_eq!(spec.memory_mb, 10 * 1024);
    }
}
