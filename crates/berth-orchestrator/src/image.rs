//! Image reference helpers used to decide whether a stopped container can be
//! restarted or must be recreated from a newer image.

use std::cmp::Ordering;

/// Split `registry/repo:tag` into `(registry/repo, tag)`. Only a colon after
/// the last `/` separates a tag, so registry ports survive. Missing tags
/// default to `latest`.
pub fn parse_image_and_tag(image: &str) -> (&str, &str) {
    let name_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[name_start..].rfind(':') {
        Some(i) => {
            let split = name_start + i;
            (&image[..split], &image[split + 1..])
        }
        None => (image, "latest"),
    }
}

/// Compare two version tags numerically (`v1.2.3`, `1.2`, `0.9.1-rc1`).
/// Pre-release and build suffixes are ignored; missing or non-numeric parts
/// count as 0.
pub fn semver_compare(a: &str, b: &str) -> Ordering {
    let pa = version_parts(a);
    let pb = version_parts(b);
    pa.cmp(&pb)
}

fn version_parts(tag: &str) -> [u64; 3] {
    let tag = tag.strip_prefix('v').unwrap_or(tag);
    let core = tag.split(|c| c == '-' || c == '+').next().unwrap_or("");
    let mut parts = [0u64; 3];
    for (slot, raw) in parts.iter_mut().zip(core.split('.')) {
        let digits: String = raw.chars().take_while(|c| c.is_ascii_digit()).collect();
        *slot = digits.parse().unwrap_or(0);
    }
    parts
}

/// Anything other than exactly the stock image (and every dev build) is
/// "custom": its tag says nothing about freshness, so an existing container is
/// always recreated.
pub fn is_custom_image(image: &str, stock_image: &str, dev_mode: bool) -> bool {
    dev_mode || image != stock_image
}

/// Whether a stopped container running `existing` must be removed before
/// `desired` can run.
pub fn should_replace(desired: &str, existing: &str, dev_mode: bool) -> bool {
    let (_, desired_tag) = parse_image_and_tag(desired);
    let (_, existing_tag) = parse_image_and_tag(existing);

    let existing_is_dev = existing_tag == "dev";
    if dev_mode != existing_is_dev {
        return true;
    }
    if desired_tag == existing_tag {
        return false;
    }
    // an older desired tag keeps the existing container
    semver_compare(desired_tag, existing_tag) == Ordering::Greater
}
