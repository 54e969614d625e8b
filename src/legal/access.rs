//! Role hierarchy and row-scope policy.

use uuid::Uuid;

use crate::db::{NoticeAudience, Role, UserRecord, Visibility};

pub fn rank(role: Role) -> u8 {
    match role {
        Role::SuperAdmin => 3,
        Role::Admin => 2,
        Role::Member => 1,
        Role::Client => 0,
    }
}

/// Firm administrators.
pub fn is_staff(role: Role) -> bool {
    matches!(role, Role::SuperAdmin | Role::Admin)
}

/// Anyone working at the firm, as opposed to a client.
pub fn is_internal(role: Role) -> bool {
    role != Role::Client
}

/// Whether `actor` may create, edit or delete an account holding `target`.
///
/// Super admins manage every role; admins manage members and clients.
pub fn can_manage_role(actor: Role, target: Role) -> bool {
    match actor {
        Role::SuperAdmin => true,
        Role::Admin => matches!(target, Role::Member | Role::Client),
        Role::Member | Role::Client => false,
    }
}

/// Row scope for queries issued on behalf of `user`.
pub fn visibility_for(user: &UserRecord) -> Visibility {
    visibility(user.id, user.role)
}

pub fn visibility(user_id: Uuid, role: Role) -> Visibility {
    match role {
        Role::SuperAdmin | Role::Admin => Visibility::All,
        Role::Member => Visibility::Member(user_id),
        Role::Client => Visibility::Client(user_id),
    }
}

/// Notice audiences a role is allowed to read.
pub fn notice_audiences_for(role: Role) -> Vec<NoticeAudience> {
    match role {
        Role::SuperAdmin | Role::Admin => vec![
            NoticeAudience::Everyone,
            NoticeAudience::Staff,
            NoticeAudience::Members,
            NoticeAudience::Clients,
        ],
        Role::Member => vec![NoticeAudience::Everyone, NoticeAudience::Members],
        Role::Client => vec![NoticeAudience::Everyone, NoticeAudience::Clients],
    }
}

/// Roles that receive notifications for a notice audience.
pub fn audience_roles(audience: NoticeAudience) -> Vec<Role> {
    match audience {
        NoticeAudience::Everyone => vec![Role::SuperAdmin, Role::Admin, Role::Member, Role::Client],
        NoticeAudience::Staff => vec![Role::SuperAdmin, Role::Admin],
        NoticeAudience::Members => vec![Role::SuperAdmin, Role::Admin, Role::Member],
        NoticeAudience::Clients => vec![Role::SuperAdmin, Role::Admin, Role::Client],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Role; 4] = [Role::SuperAdmin, Role::Admin, Role::Member, Role::Client];

    #[test]
    fn ranks_follow_hierarchy() {
        assert!(rank(Role::SuperAdmin) > rank(Role::Admin));
        assert!(rank(Role::Admin) > rank(Role::Member));
        assert!(rank(Role::Member) > rank(Role::Client));
    }

    #[test]
    fn super_admin_manages_everyone() {
        for target in ALL {
            assert!(can_manage_role(Role::SuperAdmin, target));
        }
    }

    #[test]
    fn admin_cannot_manage_peers_or_superiors() {
        assert!(!can_manage_role(Role::Admin, Role::SuperAdmin));
        assert!(!can_manage_role(Role::Admin, Role::Admin));
        assert!(can_manage_role(Role::Admin, Role::Member));
        assert!(can_manage_role(Role::Admin, Role::Client));
    }

    #[test]
    fn members_and_clients_manage_nobody() {
        for target in ALL {
            assert!(!can_manage_role(Role::Member, target));
            assert!(!can_manage_role(Role::Client, target));
        }
    }

    #[test]
    fn visibility_matches_role() {
        let id = Uuid::new_v4();
        assert_eq!(visibility(id, Role::Admin), Visibility::All);
        assert_eq!(visibility(id, Role::Member), Visibility::Member(id));
        assert_eq!(visibility(id, Role::Client), Visibility::Client(id));
    }

    #[test]
    fn notice_audiences_are_consistent_with_recipients() {
        for role in ALL {
            for audience in notice_audiences_for(role) {
                assert!(
                    audience_roles(audience).contains(&role),
                    "{role:?} can read {audience:?} but would not be notified"
                );
            }
        }
        assert!(!notice_audiences_for(Role::Member).contains(&NoticeAudience::Staff));
        assert!(!notice_audiences_for(Role::Client).contains(&NoticeAudience::Members));
    }
}
