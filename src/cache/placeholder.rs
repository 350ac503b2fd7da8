//! Placeholder images served when no tier can produce a real payload.
//!
//! Each is a 200x200 grey SVG with a caption. They are returned verbatim and
//! never written to any tier.

use super::entry::{Payload, ResourceType};

/// "No Image"
pub const PIECE_PLACEHOLDER: &str = "data:image/svg+xml;base64,PHN2ZyB3aWR0aD0iMjAwIiBoZWlnaHQ9IjIwMCIgeG1sbnM9Imh0dHA6Ly93d3cudzMub3JnLzIwMDAvc3ZnIj48cmVjdCB3aWR0aD0iMjAwIiBoZWlnaHQ9IjIwMCIgZmlsbD0iI2VlZSIvPjx0ZXh0IHg9IjUwJSIgeT0iNTAlIiBmb250LWZhbWlseT0iQXJpYWwiIGZvbnQtc2l6ZT0iMTQiIGZpbGw9IiM5OTkiIHRleHQtYW5jaG9yPSJtaWRkbGUiIGR5PSIuM2VtIj5ObyBJbWFnZTwvdGV4dD48L3N2Zz4=";

/// "No Cover"
pub const COLLECTION_PLACEHOLDER: &str = "data:image/svg+xml;base64,PHN2ZyB3aWR0aD0iMjAwIiBoZWlnaHQ9IjIwMCIgeG1sbnM9Imh0dHA6Ly93d3cudzMub3JnLzIwMDAvc3ZnIj48cmVjdCB3aWR0aD0iMjAwIiBoZWlnaHQ9IjIwMCIgZmlsbD0iI2VlZSIvPjx0ZXh0IHg9IjUwJSIgeT0iNTAlIiBmb250LWZhbWlseT0iQXJpYWwiIGZvbnQtc2l6ZT0iMTQiIGZpbGw9IiM5OTkiIHRleHQtYW5jaG9yPSJtaWRkbGUiIGR5PSIuM2VtIj5ObyBDb3ZlcjwvdGV4dD48L3N2Zz4=";

/// "No Attachment"
pub const POST_PLACEHOLDER: &str = "data:image/svg+xml;base64,PHN2ZyB3aWR0aD0iMjAwIiBoZWlnaHQ9IjIwMCIgeG1sbnM9Imh0dHA6Ly93d3cudzMub3JnLzIwMDAvc3ZnIj48cmVjdCB3aWR0aD0iMjAwIiBoZWlnaHQ9IjIwMCIgZmlsbD0iI2VlZSIvPjx0ZXh0IHg9IjUwJSIgeT0iNTAlIiBmb250LWZhbWlseT0iQXJpYWwiIGZvbnQtc2l6ZT0iMTQiIGZpbGw9IiM5OTkiIHRleHQtYW5jaG9yPSJtaWRkbGUiIGR5PSIuM2VtIj5ObyBBdHRhY2htZW50PC90ZXh0Pjwvc3ZnPg==";

/// Fixed placeholder for a resource type
pub fn placeholder_for(resource_type: ResourceType) -> Payload {
    Payload::encoded(placeholder_text(resource_type))
}

/// Placeholder data URL for a resource type
pub fn placeholder_text(resource_type: ResourceType) -> &'static str {
    match resource_type {
        ResourceType::Piece => PIECE_PLACEHOLDER,
        ResourceType::Collection => COLLECTION_PLACEHOLDER,
        ResourceType::PostAttachment => POST_PLACEHOLDER,
    }
}

/// True if `payload` is one of the fixed placeholders
pub fn is_placeholder(payload: &Payload) -> bool {
    payload
        .as_text()
        .map(|text| ResourceType::ALL.iter().any(|t| placeholder_text(*t) == text))
        .unwrap_or(false)
}
