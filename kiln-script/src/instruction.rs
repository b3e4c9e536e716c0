//! Typed build-script instructions.
//!
//! [`Instruction::from_node`] translates a raw parser [`Node`] exactly once;
//! everything downstream (dependency resolution, stage execution, cache-key
//! derivation) dispatches on the enum instead of re-inspecting strings.

use crate::node::{Heredoc, Node};
use crate::{Error, Result};

/// Shell-form vs exec-form command payload (`RUN`, `CMD`, `ENTRYPOINT`,
/// `HEALTHCHECK CMD`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellOrExec {
    /// `RUN apt-get update` — a single string handed to the shell.
    Shell(String),
    /// `RUN ["apt-get", "update"]` — argv executed directly.
    Exec(Vec<String>),
}

impl ShellOrExec {
    /// Resolves to the argv actually executed, given the stage's SHELL.
    pub fn to_argv(&self, shell: &[String]) -> Vec<String> {
        match self {
            Self::Shell(line) => {
                let mut argv: Vec<String> = shell.to_vec();
                argv.push(line.clone());
                argv
            }
            Self::Exec(argv) => argv.clone(),
        }
    }

    /// The shell-form line, if this is shell form.
    pub fn shell_line(&self) -> Option<&str> {
        match self {
            Self::Shell(line) => Some(line),
            Self::Exec(_) => None,
        }
    }
}

/// The kind of a `RUN --mount=type=…` mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum MountKind {
    /// Bind mount from the context, a stage, or an image.
    Bind,
    /// Persistent cache directory.
    Cache,
    /// Ephemeral tmpfs.
    Tmpfs,
    /// Secret file.
    Secret,
    /// SSH agent socket.
    Ssh,
}

/// A parsed `RUN --mount=…` flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// Mount kind; `type=` defaults to bind.
    pub kind: MountKind,
    /// `from=` — stage name, image reference, or additional build context.
    pub from: Option<String>,
    /// `source=` — path inside the `from` source (or the context).
    pub source: Option<String>,
    /// `target=` / `dst=` — mount point inside the working container.
    pub target: Option<String>,
    /// Remaining comma-separated options, verbatim (`ro`, `id=…`, …).
    pub options: Vec<String>,
    /// The raw flag value after `--mount=`.
    pub raw: String,
}

impl Mount {
    fn parse(raw: &str, original: &str) -> Result<Self> {
        let mut kind = MountKind::Bind;
        let mut from = None;
        let mut source = None;
        let mut target = None;
        let mut options = Vec::new();
        for part in raw.split(',').filter(|p| !p.is_empty()) {
            let (key, value) = match part.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (part, None),
            };
            match (key, value) {
                ("type", Some(v)) => {
                    kind = match v {
                        "bind" => MountKind::Bind,
                        "cache" => MountKind::Cache,
                        "tmpfs" => MountKind::Tmpfs,
                        "secret" => MountKind::Secret,
                        "ssh" => MountKind::Ssh,
                        other => {
                            return Err(Error::Malformed {
                                command: "RUN".into(),
                                message: format!("unsupported mount type {other:?}"),
                                original: original.into(),
                            });
                        }
                    };
                }
                ("from", Some(v)) => from = Some(v.to_owned()),
                ("source" | "src", Some(v)) => source = Some(v.to_owned()),
                ("target" | "dst" | "destination", Some(v)) => target = Some(v.to_owned()),
                _ => options.push(part.to_owned()),
            }
        }
        Ok(Self {
            kind,
            from,
            source,
            target,
            options,
            raw: raw.to_owned(),
        })
    }
}

/// A `FROM` instruction: the head of a build stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct From {
    /// Base image reference or the name of an earlier stage, unexpanded.
    pub image: String,
    /// Stage alias from `AS <name>`.
    pub name: Option<String>,
    /// `--platform=` override, unexpanded.
    pub platform: Option<String>,
    /// Original source text.
    pub original: String,
}

/// An `ARG` instruction; one line may declare several names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arg {
    /// Declared `(name, default)` pairs in source order.
    pub pairs: Vec<(String, Option<String>)>,
    /// Original source text.
    pub original: String,
}

/// A `RUN` instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Run {
    /// The command in shell or exec form.
    pub command: ShellOrExec,
    /// Parsed `--mount=` flags, in source order.
    pub mounts: Vec<Mount>,
    /// `--network=` flag value, if any.
    pub network: Option<String>,
    /// Heredoc bodies executed by this RUN.
    pub heredocs: Vec<Heredoc>,
    /// Original source text.
    pub original: String,
}

/// Shared payload of `ADD` and `COPY`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCopy {
    /// Source paths / URLs / heredoc names, in source order.
    pub sources: Vec<String>,
    /// Destination path inside the working container.
    pub dest: String,
    /// `--from=` — stage name, numeric stage index, or additional context.
    pub from: Option<String>,
    /// `--chown=` value, verbatim.
    pub chown: Option<String>,
    /// `--chmod=` value, verbatim.
    pub chmod: Option<String>,
    /// `--checksum=` value (ADD only), verbatim.
    pub checksum: Option<String>,
    /// `--link` requested.
    pub link: bool,
    /// `--parents` requested.
    pub parents: bool,
    /// `--exclude=` patterns, in source order.
    pub excludes: Vec<String>,
    /// Heredoc file bodies to materialize as sources.
    pub heredocs: Vec<Heredoc>,
    /// Original source text.
    pub original: String,
}

/// A `HEALTHCHECK` instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Healthcheck {
    /// `HEALTHCHECK NONE` — disable inherited healthchecks.
    pub none: bool,
    /// Raw `--interval=` / `--timeout=` / `--start-period=` / `--retries=`
    /// flag tokens, in source order.
    pub options: Vec<String>,
    /// The check command (`HEALTHCHECK CMD …`).
    pub command: Option<ShellOrExec>,
    /// Original source text.
    pub original: String,
}

/// One typed build-script instruction.
///
/// Every variant keeps the original source text: cache-key derivation for
/// metadata instructions embeds it verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Instruction {
    /// `FROM <image|stage> [AS name]`.
    From(From),
    /// `ARG name[=default] …`.
    Arg(Arg),
    /// `ENV k=v …`.
    Env {
        /// `(key, value)` pairs in source order.
        pairs: Vec<(String, String)>,
        /// Original source text.
        original: String,
    },
    /// `RUN …`.
    Run(Run),
    /// `ADD [flags] src… dest`.
    Add(FileCopy),
    /// `COPY [flags] src… dest`.
    Copy(FileCopy),
    /// `LABEL k=v …`.
    Label {
        /// `(key, value)` pairs in source order.
        pairs: Vec<(String, String)>,
        /// Original source text.
        original: String,
    },
    /// `CMD …`.
    Cmd {
        /// The default command.
        command: ShellOrExec,
        /// Original source text.
        original: String,
    },
    /// `ENTRYPOINT …`.
    Entrypoint {
        /// The entrypoint command.
        command: ShellOrExec,
        /// Original source text.
        original: String,
    },
    /// `USER <spec>`.
    User {
        /// The user (and optional group) spec, unexpanded.
        user: String,
        /// Original source text.
        original: String,
    },
    /// `WORKDIR <dir>`.
    Workdir {
        /// The directory, unexpanded.
        dir: String,
        /// Original source text.
        original: String,
    },
    /// `VOLUME <path> …`.
    Volume {
        /// Declared volume paths.
        paths: Vec<String>,
        /// Original source text.
        original: String,
    },
    /// `EXPOSE <port[/proto]> …`.
    Expose {
        /// Port specs, verbatim.
        ports: Vec<String>,
        /// Original source text.
        original: String,
    },
    /// `HEALTHCHECK …`.
    Healthcheck(Healthcheck),
    /// `STOPSIGNAL <sig>`.
    StopSignal {
        /// Signal name or number, verbatim.
        signal: String,
        /// Original source text.
        original: String,
    },
    /// `ONBUILD <trigger instruction>`.
    Onbuild {
        /// The trigger line, verbatim.
        trigger: String,
        /// Original source text.
        original: String,
    },
    /// `SHELL ["sh", "-c"]`.
    Shell {
        /// The replacement shell argv.
        shell: Vec<String>,
        /// Original source text.
        original: String,
    },
}

impl Instruction {
    /// Translates one raw parser node into a typed instruction.
    pub fn from_node(node: &Node) -> Result<Self> {
        let keyword = node.value.to_ascii_uppercase();
        match keyword.as_str() {
            "FROM" => Self::parse_from(node),
            "ARG" => Self::parse_arg(node),
            "ENV" => Ok(Self::Env {
                pairs: parse_pairs(node)?,
                original: node.original.clone(),
            }),
            "RUN" => Self::parse_run(node),
            "ADD" => Ok(Self::Add(FileCopy::parse(node)?)),
            "COPY" => Ok(Self::Copy(FileCopy::parse(node)?)),
            "LABEL" => Ok(Self::Label {
                pairs: parse_pairs(node)?,
                original: node.original.clone(),
            }),
            "CMD" => Ok(Self::Cmd {
                command: command_forms(node),
                original: node.original.clone(),
            }),
            "ENTRYPOINT" => Ok(Self::Entrypoint {
                command: command_forms(node),
                original: node.original.clone(),
            }),
            "USER" => Ok(Self::User {
                user: single_arg(node)?,
                original: node.original.clone(),
            }),
            "WORKDIR" => Ok(Self::Workdir {
                dir: single_arg(node)?,
                original: node.original.clone(),
            }),
            "VOLUME" => Ok(Self::Volume {
                paths: at_least_one(node)?,
                original: node.original.clone(),
            }),
            "EXPOSE" => Ok(Self::Expose {
                ports: at_least_one(node)?,
                original: node.original.clone(),
            }),
            "HEALTHCHECK" => Self::parse_healthcheck(node),
            "STOPSIGNAL" => Ok(Self::StopSignal {
                signal: single_arg(node)?,
                original: node.original.clone(),
            }),
            "ONBUILD" => Ok(Self::Onbuild {
                trigger: rest_after_flags(node).to_owned(),
                original: node.original.clone(),
            }),
            "SHELL" => {
                if node.children.is_empty() {
                    return Err(malformed(node, "requires a JSON argv array"));
                }
                Ok(Self::Shell {
                    shell: node.children.clone(),
                    original: node.original.clone(),
                })
            }
            _ => Err(Error::UnknownInstruction(node.value.clone())),
        }
    }

    /// Translates every line of a script, in order.
    pub fn from_script(script: &crate::Script) -> Result<Vec<Self>> {
        script.children.iter().map(Self::from_node).collect()
    }

    fn parse_from(node: &Node) -> Result<Self> {
        let image = node
            .children
            .first()
            .ok_or_else(|| malformed(node, "requires an image reference"))?
            .clone();
        let name = match node.children.get(1).map(|t| t.to_ascii_uppercase()) {
            Some(ref kw) if kw == "AS" => Some(
                node.children
                    .get(2)
                    .ok_or_else(|| malformed(node, "AS requires a stage name"))?
                    .clone(),
            ),
            Some(_) => return Err(malformed(node, "trailing tokens after image")),
            None => None,
        };
        Ok(Self::From(From {
            image,
            name,
            platform: flag_value(node, "platform").map(str::to_owned),
            original: node.original.clone(),
        }))
    }

    fn parse_arg(node: &Node) -> Result<Self> {
        if node.children.is_empty() {
            return Err(malformed(node, "requires at least one name"));
        }
        let pairs = node
            .children
            .iter()
            .map(|token| match token.split_once('=') {
                Some((name, default)) => (name.to_owned(), Some(default.to_owned())),
                None => (token.clone(), None),
            })
            .collect();
        Ok(Self::Arg(Arg {
            pairs,
            original: node.original.clone(),
        }))
    }

    fn parse_run(node: &Node) -> Result<Self> {
        let mut mounts = Vec::new();
        for raw in flag_values(node, "mount") {
            mounts.push(Mount::parse(raw, &node.original)?);
        }
        Ok(Self::Run(Run {
            command: command_forms(node),
            mounts,
            network: flag_value(node, "network").map(str::to_owned),
            heredocs: node.heredocs.clone(),
            original: node.original.clone(),
        }))
    }

    fn parse_healthcheck(node: &Node) -> Result<Self> {
        let first = node
            .children
            .first()
            .ok_or_else(|| malformed(node, "requires NONE or CMD"))?;
        match first.to_ascii_uppercase().as_str() {
            "NONE" => Ok(Self::Healthcheck(Healthcheck {
                none: true,
                options: Vec::new(),
                command: None,
                original: node.original.clone(),
            })),
            "CMD" => {
                let rest = rest_after_flags(node);
                let rest = rest
                    .trim_start()
                    .strip_prefix(first.as_str())
                    .unwrap_or(rest)
                    .trim_start();
                let command = if rest.starts_with('[') {
                    ShellOrExec::Exec(node.children[1..].to_vec())
                } else {
                    ShellOrExec::Shell(rest.to_owned())
                };
                Ok(Self::Healthcheck(Healthcheck {
                    none: false,
                    options: node.flags.clone(),
                    command: Some(command),
                    original: node.original.clone(),
                }))
            }
            _ => Err(malformed(node, "requires NONE or CMD")),
        }
    }

    /// Uppercased command keyword.
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::From(_) => "FROM",
            Self::Arg(_) => "ARG",
            Self::Env { .. } => "ENV",
            Self::Run(_) => "RUN",
            Self::Add(_) => "ADD",
            Self::Copy(_) => "COPY",
            Self::Label { .. } => "LABEL",
            Self::Cmd { .. } => "CMD",
            Self::Entrypoint { .. } => "ENTRYPOINT",
            Self::User { .. } => "USER",
            Self::Workdir { .. } => "WORKDIR",
            Self::Volume { .. } => "VOLUME",
            Self::Expose { .. } => "EXPOSE",
            Self::Healthcheck(_) => "HEALTHCHECK",
            Self::StopSignal { .. } => "STOPSIGNAL",
            Self::Onbuild { .. } => "ONBUILD",
            Self::Shell { .. } => "SHELL",
        }
    }

    /// Original source text of the instruction line.
    pub fn original(&self) -> &str {
        match self {
            Self::From(f) => &f.original,
            Self::Arg(a) => &a.original,
            Self::Env { original, .. }
            | Self::Label { original, .. }
            | Self::Cmd { original, .. }
            | Self::Entrypoint { original, .. }
            | Self::User { original, .. }
            | Self::Workdir { original, .. }
            | Self::Volume { original, .. }
            | Self::Expose { original, .. }
            | Self::StopSignal { original, .. }
            | Self::Onbuild { original, .. }
            | Self::Shell { original, .. } => original,
            Self::Run(r) => &r.original,
            Self::Add(c) | Self::Copy(c) => &c.original,
            Self::Healthcheck(h) => &h.original,
        }
    }

    /// Whether this instruction produces a new filesystem layer in
    /// multi-layer mode. Exactly `ADD`, `COPY`, and `RUN` do.
    pub fn requires_layer(&self) -> bool {
        matches!(self, Self::Add(_) | Self::Copy(_) | Self::Run(_))
    }
}

impl FileCopy {
    fn parse(node: &Node) -> Result<Self> {
        let mut tokens = node.children.clone();
        if tokens.len() < 2 && node.heredocs.is_empty() {
            return Err(malformed(node, "requires at least one source and a destination"));
        }
        let dest = tokens
            .pop()
            .ok_or_else(|| malformed(node, "requires a destination"))?;
        Ok(Self {
            sources: tokens,
            dest,
            from: flag_value(node, "from").map(str::to_owned),
            chown: flag_value(node, "chown").map(str::to_owned),
            chmod: flag_value(node, "chmod").map(str::to_owned),
            checksum: flag_value(node, "checksum").map(str::to_owned),
            link: has_flag(node, "link"),
            parents: has_flag(node, "parents"),
            excludes: flag_values(node, "exclude").map(str::to_owned).collect(),
            heredocs: node.heredocs.clone(),
            original: node.original.clone(),
        })
    }
}

fn malformed(node: &Node, message: &str) -> Error {
    Error::Malformed {
        command: node.value.to_ascii_uppercase(),
        message: message.into(),
        original: node.original.clone(),
    }
}

/// The value of the first `--{key}=value` flag on the node.
fn flag_value<'a>(node: &'a Node, key: &'a str) -> Option<&'a str> {
    flag_values(node, key).next()
}

/// All values of `--{key}=value` flags on the node, in source order.
fn flag_values<'a>(node: &'a Node, key: &'a str) -> impl Iterator<Item = &'a str> {
    node.flags.iter().filter_map(move |flag| {
        flag.strip_prefix("--")
            .and_then(|f| f.split_once('='))
            .filter(|(k, _)| *k == key)
            .map(|(_, v)| v)
    })
}

/// Whether a valueless `--{key}` flag (or `--{key}=true`) is present.
fn has_flag(node: &Node, key: &str) -> bool {
    node.flags.iter().any(|flag| {
        flag.strip_prefix("--").is_some_and(|f| {
            f == key || f.split_once('=').is_some_and(|(k, v)| k == key && v == "true")
        })
    })
}

/// The original text after the command keyword and any flag tokens.
fn rest_after_flags(node: &Node) -> &str {
    let mut rest = node.original.trim_start();
    // Skip the keyword plus one token per flag; flags always precede args.
    for _ in 0..=node.flags.len() {
        rest = match rest.find(char::is_whitespace) {
            Some(at) => rest[at..].trim_start(),
            None => return "",
        };
    }
    rest
}

/// Distinguishes exec-form (`["a", "b"]`) from shell-form arguments.
fn command_forms(node: &Node) -> ShellOrExec {
    let rest = rest_after_flags(node);
    if rest.trim_start().starts_with('[') {
        ShellOrExec::Exec(node.children.clone())
    } else {
        ShellOrExec::Shell(rest.to_owned())
    }
}

/// `K=V`-pair parsing for ENV and LABEL, accepting the legacy
/// space-separated form (`ENV key some value`).
fn parse_pairs(node: &Node) -> Result<Vec<(String, String)>> {
    let tokens = &node.children;
    let first = tokens.first().ok_or_else(|| malformed(node, "requires arguments"))?;
    if first.contains('=') {
        tokens
            .iter()
            .map(|token| {
                token
                    .split_once('=')
                    .map(|(k, v)| (k.to_owned(), v.to_owned()))
                    .ok_or_else(|| malformed(node, "expected key=value"))
            })
            .collect()
    } else {
        if tokens.len() < 2 {
            return Err(malformed(node, "expected a key and a value"));
        }
        Ok(vec![(first.clone(), tokens[1..].join(" "))])
    }
}

/// Exactly one argument token.
fn single_arg(node: &Node) -> Result<String> {
    match node.children.as_slice() {
        [one] => Ok(one.clone()),
        _ => Err(malformed(node, "requires exactly one argument")),
    }
}

/// One or more argument tokens.
fn at_least_one(node: &Node) -> Result<Vec<String>> {
    if node.children.is_empty() {
        return Err(malformed(node, "requires at least one argument"));
    }
    Ok(node.children.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(value: &str, original: &str, flags: &[&str], children: &[&str]) -> Node {
        Node {
            value: value.into(),
            original: original.into(),
            flags: flags.iter().map(|s| (*s).to_owned()).collect(),
            children: children.iter().map(|s| (*s).to_owned()).collect(),
            heredocs: Vec::new(),
        }
    }

    #[test]
    fn from_with_alias_and_platform() {
        let n = node(
            "FROM",
            "FROM --platform=linux/arm64 alpine:3.20 AS builder",
            &["--platform=linux/arm64"],
            &["alpine:3.20", "AS", "builder"],
        );
        let Instruction::From(from) = Instruction::from_node(&n).unwrap() else {
            panic!("expected FROM");
        };
        assert_eq!(from.image, "alpine:3.20");
        assert_eq!(from.name.as_deref(), Some("builder"));
        assert_eq!(from.platform.as_deref(), Some("linux/arm64"));
    }

    #[test]
    fn run_shell_form_keeps_original_text() {
        let n = node(
            "RUN",
            "RUN apt-get update && apt-get install -y curl",
            &[],
            &["apt-get", "update", "&&", "apt-get", "install", "-y", "curl"],
        );
        let Instruction::Run(run) = Instruction::from_node(&n).unwrap() else {
            panic!("expected RUN");
        };
        assert_eq!(
            run.command.shell_line(),
            Some("apt-get update && apt-get install -y curl")
        );
    }

    #[test]
    fn run_exec_form() {
        let n = node(
            "RUN",
            r#"RUN ["sh", "-c", "true"]"#,
            &[],
            &["sh", "-c", "true"],
        );
        let Instruction::Run(run) = Instruction::from_node(&n).unwrap() else {
            panic!("expected RUN");
        };
        assert_eq!(
            run.command,
            ShellOrExec::Exec(vec!["sh".into(), "-c".into(), "true".into()])
        );
    }

    #[test]
    fn run_mount_flag() {
        let n = node(
            "RUN",
            "RUN --mount=type=bind,from=builder,source=/src,target=/dst,ro make",
            &["--mount=type=bind,from=builder,source=/src,target=/dst,ro"],
            &["make"],
        );
        let Instruction::Run(run) = Instruction::from_node(&n).unwrap() else {
            panic!("expected RUN");
        };
        assert_eq!(run.mounts.len(), 1);
        let mount = &run.mounts[0];
        assert_eq!(mount.kind, MountKind::Bind);
        assert_eq!(mount.from.as_deref(), Some("builder"));
        assert_eq!(mount.source.as_deref(), Some("/src"));
        assert_eq!(mount.target.as_deref(), Some("/dst"));
        assert_eq!(mount.options, vec!["ro".to_owned()]);
        assert_eq!(run.command.shell_line(), Some("make"));
    }

    #[test]
    fn copy_flags() {
        let n = node(
            "COPY",
            "COPY --from=0 --chown=1000:1000 --link /a /b /dest/",
            &["--from=0", "--chown=1000:1000", "--link"],
            &["/a", "/b", "/dest/"],
        );
        let Instruction::Copy(copy) = Instruction::from_node(&n).unwrap() else {
            panic!("expected COPY");
        };
        assert_eq!(copy.sources, vec!["/a".to_owned(), "/b".to_owned()]);
        assert_eq!(copy.dest, "/dest/");
        assert_eq!(copy.from.as_deref(), Some("0"));
        assert_eq!(copy.chown.as_deref(), Some("1000:1000"));
        assert!(copy.link);
        assert!(!copy.parents);
    }

    #[test]
    fn env_legacy_form() {
        let n = node("ENV", "ENV PATH /usr/local/bin", &[], &["PATH", "/usr/local/bin"]);
        let Instruction::Env { pairs, .. } = Instruction::from_node(&n).unwrap() else {
            panic!("expected ENV");
        };
        assert_eq!(pairs, vec![("PATH".to_owned(), "/usr/local/bin".to_owned())]);
    }

    #[test]
    fn arg_multiple_names() {
        let n = node("ARG", "ARG A=1 B", &[], &["A=1", "B"]);
        let Instruction::Arg(arg) = Instruction::from_node(&n).unwrap() else {
            panic!("expected ARG");
        };
        assert_eq!(
            arg.pairs,
            vec![("A".to_owned(), Some("1".to_owned())), ("B".to_owned(), None)]
        );
    }

    #[test]
    fn healthcheck_none_and_cmd() {
        let none = node("HEALTHCHECK", "HEALTHCHECK NONE", &[], &["NONE"]);
        let Instruction::Healthcheck(h) = Instruction::from_node(&none).unwrap() else {
            panic!("expected HEALTHCHECK");
        };
        assert!(h.none);

        let cmd = node(
            "HEALTHCHECK",
            "HEALTHCHECK --interval=30s CMD curl -f http://localhost/",
            &["--interval=30s"],
            &["CMD", "curl", "-f", "http://localhost/"],
        );
        let Instruction::Healthcheck(h) = Instruction::from_node(&cmd).unwrap() else {
            panic!("expected HEALTHCHECK");
        };
        assert!(!h.none);
        assert_eq!(
            h.command.unwrap().shell_line(),
            Some("curl -f http://localhost/")
        );
    }

    #[test]
    fn layer_producing_commands() {
        let run = node("RUN", "RUN true", &[], &["true"]);
        let env = node("ENV", "ENV A=1", &[], &["A=1"]);
        assert!(Instruction::from_node(&run).unwrap().requires_layer());
        assert!(!Instruction::from_node(&env).unwrap().requires_layer());
    }

    #[test]
    fn unknown_instruction() {
        let n = node("FETCH", "FETCH something", &[], &["something"]);
        assert!(matches!(
            Instruction::from_node(&n),
            Err(Error::UnknownInstruction(_))
        ));
    }
}
