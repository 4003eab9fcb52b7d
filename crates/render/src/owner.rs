use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kfn_core::Function;
use kube::Resource;

use crate::DesiredChildren;

/// Owner references could not be established. Not transient: retrying will not help
/// until the owner or the conflicting child is fixed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OwnershipError {
    #[error("owner is missing metadata.{0}")]
    MissingOwnerField(&'static str),
    #[error("{child} is already controlled by {kind} {owner} (uid {uid})")]
    AlreadyOwned { child: String, kind: String, owner: String, uid: String },
}

/// Controller reference pointing at `owner`.
pub fn controller_ref(owner: &Function) -> Result<OwnerReference, OwnershipError> {
    if owner.meta().name.is_none() {
        return Err(OwnershipError::MissingOwnerField("name"));
    }
    if owner.meta().uid.is_none() {
        return Err(OwnershipError::MissingOwnerField("uid"));
    }
    owner.controller_owner_ref(&()).ok_or(OwnershipError::MissingOwnerField("uid"))
}

/// Fail if `meta` is controlled by anything other than `oref`'s owner.
pub fn check_adoptable(oref: &OwnerReference, meta: &ObjectMeta) -> Result<(), OwnershipError> {
    let foreign = meta
        .owner_references
        .iter()
        .flatten()
        .find(|r| r.controller == Some(true) && r.uid != oref.uid);
    match foreign {
        Some(r) => Err(OwnershipError::AlreadyOwned {
            child: meta.name.clone().unwrap_or_default(),
            kind: r.kind.clone(),
            owner: r.name.clone(),
            uid: r.uid.clone(),
        }),
        None => Ok(()),
    }
}

/// Stamp `oref` onto `meta`, replacing any earlier reference to the same owner.
pub fn bind_owner(oref: &OwnerReference, meta: &mut ObjectMeta) -> Result<(), OwnershipError> {
    check_adoptable(oref, meta)?;
    let refs = meta.owner_references.get_or_insert_with(Vec::new);
    refs.retain(|r| r.uid != oref.uid);
    refs.push(oref.clone());
    Ok(())
}

/// Bind every desired child to `owner`.
pub fn bind_children(owner: &Function, children: &mut DesiredChildren) -> Result<OwnerReference, OwnershipError> {
    let oref = controller_ref(owner)?;
    bind_owner(&oref, &mut children.artifact.metadata)?;
    bind_owner(&oref, &mut children.network.metadata)?;
    bind_owner(&oref, &mut children.workload.metadata)?;
    Ok(oref)
}
