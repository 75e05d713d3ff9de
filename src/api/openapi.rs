use super::handlers::{entitlements, health, resources, sessions};
use utoipa::openapi::{InfoBuilder, OpenApiBuilder, Tag};
use utoipa_axum::{router::OpenApiRouter, routes};

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    // Reuse the router wiring and only return the generated spec.
    let (_router, mut spec) = public_router().split_for_parts();
    let (_router, protected) = protected_router().split_for_parts();
    spec.merge(protected);
    spec
}

/// Routes served without the admission pipeline: health plus the
/// collaborator/admin surface.
///
/// Add new endpoints via `.routes(routes!(...))` so they are both served and
/// documented.
pub(crate) fn public_router() -> OpenApiRouter {
    let mut router = OpenApiRouter::with_openapi(cargo_openapi())
        .routes(routes!(health::health))
        .routes(routes!(sessions::create_session))
        .routes(routes!(sessions::introspect_session))
        .routes(routes!(sessions::revoke_session))
        .routes(routes!(entitlements::grant_entitlement))
        .routes(routes!(entitlements::revoke_entitlement))
        .routes(routes!(entitlements::list_entitlements));

    let mut health_tag = Tag::new("health");
    health_tag.description = Some("Dependency health".to_string());
    let mut sessions_tag = Tag::new("sessions");
    sessions_tag.description = Some("Collaborator-facing session lifecycle".to_string());
    let mut entitlements_tag = Tag::new("entitlements");
    entitlements_tag.description = Some("Entitlement administration".to_string());
    let mut resources_tag = Tag::new("resources");
    resources_tag.description = Some("Routes behind the admission pipeline".to_string());

    router.get_openapi_mut().tags = Some(vec![
        health_tag,
        sessions_tag,
        entitlements_tag,
        resources_tag,
    ]);

    router
}

/// Routes wrapped in the admission pipeline by the server wiring.
pub(crate) fn protected_router() -> OpenApiRouter {
    OpenApiRouter::new().routes(routes!(resources::get_resource))
}

fn cargo_openapi() -> utoipa::openapi::OpenApi {
    let info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(Some(env!("CARGO_PKG_DESCRIPTION")))
        .build();
    OpenApiBuilder::new().info(info).build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_info_from_cargo() {
        let spec = openapi();
        assert_eq!(spec.info.title, env!("CARGO_PKG_NAME"));
        assert_eq!(spec.info.version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn openapi_covers_public_and_protected_paths() {
        let spec = openapi();
        assert!(spec.paths.paths.contains_key("/health"));
        assert!(spec.paths.paths.contains_key("/v1/sessions"));
        assert!(spec.paths.paths.contains_key("/v1/entitlements"));
        assert!(
            spec.paths
                .paths
                .contains_key("/v1/resources/{resource_id}")
        );
    }
}
