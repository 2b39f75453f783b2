//! Final-attribute application shared by the chunked and server-side engines.

use tracing::{debug, trace};

use datamover_location::{
    AccessCondition, ContentProperties, DestinationKind, ObjectDestination, ObjectSource,
};

use crate::TransferError;
use crate::shared::FinalAttributes;

/// Attributes to apply at commit, fetched from the source unless they were
/// already captured.
pub async fn final_attributes(
    captured: Option<FinalAttributes>,
    source: &dyn ObjectSource,
) -> Result<FinalAttributes, TransferError> {
    if let Some(attrs) = captured {
        return Ok(attrs);
    }
    trace!(source = %source.location(), "re-fetching source attributes for commit");
    let attrs = source.fetch_attributes().await?;
    Ok(FinalAttributes {
        properties: attrs.properties,
        metadata: attrs.metadata,
    })
}

/// Commits a destination whose data is fully written.
///
/// Block destinations submit `block_ids` in order. The block-list call
/// cannot carry an empty content type, so an explicit clear follows it.
pub async fn commit_destination(
    dest: &dyn ObjectDestination,
    kind: DestinationKind,
    block_ids: Vec<String>,
    attrs: FinalAttributes,
    content_md5: Option<&str>,
) -> Result<(), TransferError> {
    let mut props = attrs.properties;
    if let Some(md5) = content_md5 {
        props.content_md5 = Some(md5.to_string());
    }
    if kind == DestinationKind::BlockBlob {
        let blocks = block_ids.len();
        let clear_type = props.content_type_is_empty();
        dest.submit_block_list(block_ids, props.clone(), attrs.metadata, AccessCondition::none())
            .await?;
        debug!(destination = %dest.location(), blocks, "block list committed");
        if clear_type {
            props.content_type = Some(String::new());
            dest.set_properties(props).await?;
        }
    } else {
        dest.commit(props, attrs.metadata).await?;
        dest.flush().await?;
        debug!(destination = %dest.location(), "destination committed");
    }
    Ok(())
}

/// Undoes defaults a whole-object put forced onto empty properties.
pub async fn normalize_after_put(
    dest: &dyn ObjectDestination,
    desired: &ContentProperties,
) -> Result<(), TransferError> {
    let actual = dest.fetch_attributes().await?.properties;
    let type_forced = desired.content_type_is_empty() && !actual.content_type_is_empty();
    let encoding_forced =
        desired.content_encoding_is_empty() && !actual.content_encoding_is_empty();
    if !type_forced && !encoding_forced {
        return Ok(());
    }
    let mut fixed = desired.clone();
    if type_forced {
        fixed.content_type = Some(String::new());
    }
    if encoding_forced {
        fixed.content_encoding = Some(String::new());
    }
    if fixed.content_md5.is_none() {
        fixed.content_md5 = actual.content_md5;
    }
    debug!(destination = %dest.location(), "clearing defaulted content properties");
    dest.set_properties(fixed).await?;
    Ok(())
}
