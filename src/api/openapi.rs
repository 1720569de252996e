use utoipa::openapi::{Contact, InfoBuilder, License, OpenApiBuilder, Tag};
use utoipa_axum::{router::OpenApiRouter, routes};

use super::handlers::{admin, health, user};

/// OpenAPI document for the user surface (the public one).
#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    let (_router, openapi) = user_router().split_for_parts();
    openapi
}

/// Build the user-surface router that also drives its `OpenAPI` document.
///
/// Add new endpoints here via `.routes(routes!(...))` so they are both served
/// and documented.
pub(crate) fn user_router() -> OpenApiRouter {
    let mut router = OpenApiRouter::with_openapi(cargo_openapi())
        .routes(routes!(health::health))
        .routes(routes!(user::auth_state))
        .routes(routes!(user::auth_session_post))
        .routes(routes!(user::auth_secondary_post))
        .routes(routes!(user::auth_request_get))
        .routes(routes!(user::auth_callback_get))
        .routes(routes!(user::auth_u2f_app_get))
        .routes(routes!(user::auth_u2f_sign_get, user::auth_u2f_sign_post))
        .routes(routes!(
            user::auth_u2f_register_get,
            user::auth_u2f_register_post
        ))
        .routes(routes!(user::logout_get))
        .routes(routes!(user::logout_all_get));

    router.get_openapi_mut().tags = Some(tags());
    router
}

/// Build the management-surface router.
pub(crate) fn admin_router() -> OpenApiRouter {
    let mut router = OpenApiRouter::with_openapi(cargo_openapi())
        .routes(routes!(health::health))
        .routes(routes!(admin::auth_state))
        .routes(routes!(admin::auth_session_post))
        .routes(routes!(admin::auth_secondary_post))
        .routes(routes!(admin::auth_request_get))
        .routes(routes!(admin::auth_callback_get))
        .routes(routes!(admin::auth_u2f_sign_get, admin::auth_u2f_sign_post))
        .routes(routes!(admin::logout_get));

    router.get_openapi_mut().tags = Some(tags());
    router
}

fn tags() -> Vec<Tag> {
    let mut auth_tag = Tag::new("auth");
    auth_tag.description = Some("Authentication and two-factor orchestration".to_string());

    let mut health_tag = Tag::new("health");
    health_tag.description = Some("Service health".to_string());

    vec![auth_tag, health_tag]
}

fn cargo_openapi() -> utoipa::openapi::OpenApi {
    // Use Cargo.toml metadata instead of the utoipa-axum crate info defaults.
    let mut info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(optional_str(env!("CARGO_PKG_DESCRIPTION")))
        .build();

    info.contact = cargo_contact();
    info.license = cargo_license();

    OpenApiBuilder::new().info(info).build()
}

fn cargo_contact() -> Option<Contact> {
    // Cargo authors are `;` separated and may include "Name <email>".
    let authors = env!("CARGO_PKG_AUTHORS");
    let primary = authors.split(';').next().map(str::trim)?;
    if primary.is_empty() {
        return None;
    }

    let (name, email) = parse_author(primary);
    if name.is_none() && email.is_none() {
        return None;
    }

    let mut contact = Contact::new();
    contact.name = name.map(str::to_string);
    contact.email = email.map(str::to_string);
    Some(contact)
}

fn cargo_license() -> Option<License> {
    let identifier = optional_str(env!("CARGO_PKG_LICENSE"))?;
    let mut license = License::new(identifier);
    license.identifier = Some(identifier.to_string());
    Some(license)
}

fn optional_str(value: &'static str) -> Option<&'static str> {
    let trimmed = value.trim();
    if trimmed.is_empty() { None } else { Some(trimmed) }
}

fn parse_author(author: &str) -> (Option<&str>, Option<&str>) {
    if let Some(start) = author.find('<') {
        let name = author[..start].trim();
        let email = author[start + 1..].trim_end_matches('>').trim();
        let name = if name.is_empty() { None } else { Some(name) };
        let email = if email.is_empty() { None } else { Some(email) };
        (name, email)
    } else {
        let name = author.trim();
        (if name.is_empty() { None } else { Some(name) }, None)
    }
}
