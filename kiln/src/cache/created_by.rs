//! Derivation of history `created_by` strings.
//!
//! The `created_by` string is the canonical identity of a step: it is
//! stored in the committed image's history and it is the primary input to
//! cache probes. It must be bit-for-bit stable across builds — same script,
//! same inputs, same string — or the layer cache never hits.

use kiln_script::Heredoc;

use crate::options::BuildOptions;

/// Placeholder `created_by` for a FROM step; never matched against.
pub fn for_from() -> String {
    "/bin/sh".to_owned()
}

/// `created_by` for an ARG step: the sorted names seen so far in the stage.
pub fn for_arg(names_seen_in_stage: &[String], suffix: &str) -> String {
    let mut names: Vec<&str> = names_seen_in_stage.iter().map(String::as_str).collect();
    names.sort_unstable();
    format!("/bin/sh -c #(nop) ARG {}{suffix}", names.join(" "))
}

/// `created_by` for metadata steps (ENV, USER, WORKDIR, LABEL, CMD,
/// ENTRYPOINT, EXPOSE, VOLUME, HEALTHCHECK, STOPSIGNAL, ONBUILD, SHELL):
/// the original source text, verbatim.
pub fn for_metadata(original: &str, suffix: &str) -> String {
    format!("/bin/sh -c #(nop) {original}{suffix}")
}

/// `created_by` for ADD/COPY.
///
/// `content_summary` is `<type>:<hex>` where type is `file`, `dir`, or
/// `multi` and the hex is the canonical-tar content digest. The link flag
/// participates only when the build is layered (hard-link copies change
/// the committed layer format).
pub fn for_copy(
    verb: &str,
    link: bool,
    layered: bool,
    content_summary: &str,
    dest: &str,
    suffix: &str,
) -> String {
    let link_flag = if link && layered { " --link" } else { "" };
    format!("/bin/sh -c #(nop) {verb}{link_flag} {content_summary} in {dest} {suffix}")
}

/// `created_by` for RUN.
///
/// `build_args` are the in-scope, non-env-overridden args, sorted by name;
/// heredoc bodies and per-mount checksums are folded in so that changing
/// either invalidates the cache.
pub fn for_run(
    build_args: &[(String, String)],
    command_text: &str,
    heredocs: &[Heredoc],
    mount_checksums: &[String],
    suffix: &str,
) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(build_args.len() + 2);
    parts.push(format!("|{}", build_args.len()));
    for (name, value) in build_args {
        parts.push(format!("{name}={value}"));
    }
    let mut text = format!("{} /bin/sh -c {command_text}", parts.join(" "));
    for heredoc in heredocs {
        text.push('\n');
        text.push_str(&heredoc.content);
    }
    for checksum in mount_checksums {
        text.push(':');
        text.push_str(checksum);
    }
    text.push_str(suffix);
    text
}

/// The flag suffix appended to every step's `created_by`.
///
/// Encodes options that do not change filesystem bytes but do change the
/// committed image, so they must invalidate the cache. Annotation-related
/// pieces apply only to the last step of the last stage.
pub fn metadata_suffix(options: &BuildOptions, final_step_of_final_stage: bool) -> String {
    let mut suffix = String::new();
    if options.inherit_labels.is_false() {
        suffix.push_str("|inheritLabels=false");
    }
    for key in &options.unset_labels {
        suffix.push_str("|unsetLabel=");
        suffix.push_str(key);
    }
    if final_step_of_final_stage {
        let mut unset = options.unset_annotations.clone();
        unset.sort_unstable();
        for key in &unset {
            suffix.push_str("|unsetAnnotation=");
            suffix.push_str(key);
        }
        if options.inherit_annotations.is_false() {
            suffix.push_str("|inheritAnnotations=false");
        }
        for annotation in &options.annotations {
            suffix.push_str("|annotation=");
            suffix.push_str(annotation);
        }
    }
    if let Some(token) = options.layer_mtime_token() {
        suffix.push_str(&token);
    }
    suffix
}
