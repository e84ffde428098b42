//! CRD installation utilities
//!
//! The operator installs its own CRDs on startup using server-side apply so
//! the stored schema always matches the running version.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use testplane_common::crd::{IntegrationTest, LoadTest};

const FIELD_MANAGER: &str = "testplane-operator";

/// CRD definition with name and resource
struct CrdDef {
    name: String,
    crd: CustomResourceDefinition,
}

fn crd_def<K: CustomResourceExt>() -> CrdDef {
    CrdDef {
        name: K::crd_name().to_string(),
        crd: K::crd(),
    }
}

fn all_crds() -> Vec<CrdDef> {
    vec![crd_def::<IntegrationTest>(), crd_def::<LoadTest>()]
}

/// Both CRDs as a multi-document YAML stream
pub fn crds_yaml() -> anyhow::Result<String> {
    let docs = all_crds()
        .into_iter()
        .map(|def| {
            serde_yaml::to_string(&def.crd)
                .map_err(|e| anyhow::anyhow!("failed to serialize {} CRD: {}", def.name, e))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(docs.join("---\n"))
}

/// Ensure both CRDs are installed
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for def in all_crds() {
        tracing::info!(crd = %def.name, "installing CRD");
        crds.patch(&def.name, &params, &Patch::Apply(&def.crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", def.name, e))?;
    }
    tracing::info!("CRDs installed/updated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_crds_are_rendered() {
        let yaml = crds_yaml().unwrap();
        assert!(yaml.contains("integrationtests.infra.testplane.io"));
        assert!(yaml.contains("loadtests.infra.testplane.io"));
        assert_eq!(yaml.matches("kind: CustomResourceDefinition").count(), 2);
    }

    #[test]
    fn crd_names_follow_the_api_group() {
        let names: Vec<String> = all_crds().into_iter().map(|d| d.name).collect();
        assert_eq!(
            names,
            vec![
                "integrationtests.infra.testplane.io",
                "loadtests.infra.testplane.io"
            ]
        );
    }
}
