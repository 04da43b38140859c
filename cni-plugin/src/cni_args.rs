/// Returned when `CNI_ARGS` does not identify a pod.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("{0} not found in CNI_ARGS")]
pub struct MissingArg(pub &'static str);

/// Derives the slot name, `<namespace>/<name>`, from `CNI_ARGS`
/// (`K=V` pairs separated by `;`).
pub fn slot_name(cni_args: &str) -> Result<String, MissingArg> {
    let mut namespace = None;
    let mut name = None;
    for arg in cni_args.split(';') {
        match arg.split_once('=') {
            Some(("K8S_POD_NAMESPACE", v)) if !v.is_empty() => namespace = Some(v),
            Some(("K8S_POD_NAME", v)) if !v.is_empty() => name = Some(v),
            _ => {}
        }
    }

    let namespace = namespace.ok_or(MissingArg("K8S_POD_NAMESPACE"))?;
    let name = name.ok_or(MissingArg("K8S_POD_NAME"))?;
    Ok(format!("{namespace}/{name}"))
}
