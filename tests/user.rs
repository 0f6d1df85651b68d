pub mod common;

use repair_desk::api;
use reqwest::StatusCode;

#[tokio::test]
async fn retrieves_current_user() {
    let server = common::Server::start().await;
    let user = server
        .login("alice@example.com")
        .await
        .user()
        .await
        .unwrap();
    assert_eq!(user.id, common::id(1));
    assert_eq!(user.name, "Alice");
    assert_eq!(user.email, "alice@example.com");
    assert_eq!(user.role, api::user::Role::Customer);
}

#[tokio::test]
async fn fails_when_unauthorized() {
    let server = common::Server::start().await;
    let status = server.client().user().await.unwrap_err();
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn reports_permissions_per_role() {
    let server = common::Server::start().await;

    let alice = server.login("alice@example.com").await;
    let permissions = alice.permissions().await.unwrap();
    assert_eq!(permissions["canCreateTickets"], true);
    assert_eq!(permissions["canAssignTickets"], false);
    assert_eq!(permissions["canManageUsers"], false);

    let bob = server.login("bob@example.com").await;
    let permissions = bob.permissions().await.unwrap();
    assert_eq!(permissions["canCreateTickets"], false);
    assert_eq!(permissions["canDeleteTickets"], false);

    let carol = server.login("carol@example.com").await;
    let permissions = carol.permissions().await.unwrap();
    assert_eq!(permissions["canAssignTickets"], true);
    assert_eq!(permissions["canViewAllTickets"], true);
    assert_eq!(permissions["canGenerateReports"], true);
}

#[tokio::test]
async fn changes_password() {
    let server = common::Server::start().await;
    let alice = server.login("alice@example.com").await;

    let status = alice
        .change_password("wrong", "new-password")
        .await
        .unwrap_err();
    assert_eq!(status, StatusCode::BAD_REQUEST);

    alice
        .change_password(common::PASSWORD, "new-password")
        .await
        .unwrap();

    let status = server
        .client()
        .try_auth("alice@example.com", common::PASSWORD)
        .await
        .unwrap_err();
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(server
        .client()
        .try_auth("alice@example.com", "new-password")
        .await
        .is_ok());
}

#[tokio::test]
async fn admin_lists_and_creates_users() {
    let server = common::Server::start().await;
    let carol = server.login("carol@example.com").await;

    assert_eq!(carol.list_users().await.unwrap().len(), common::USERS.len());

    let profile = carol
        .add_user("gina@example.com", "Gina", api::user::Role::Executor)
        .await
        .unwrap();
    assert_eq!(profile.role, api::user::Role::Executor);

    let executors = carol.executors().await.unwrap();
    assert!(executors.iter().any(|e| e.id == profile.id));
    assert!(executors.iter().all(|e| e.role == api::user::Role::Executor));
}

#[tokio::test]
async fn only_admin_manages_users() {
    let server = common::Server::start().await;
    let alice = server.login("alice@example.com").await;

    assert_eq!(alice.list_users().await.unwrap_err(), StatusCode::FORBIDDEN);
    let status = alice
        .add_user("gina@example.com", "Gina", api::user::Role::Admin)
        .await
        .unwrap_err();
    assert_eq!(status, StatusCode::FORBIDDEN);
    let status = alice.toggle_user(common::id(4)).await.unwrap_err();
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn admin_cant_deactivate_self() {
    let server = common::Server::start().await;
    let carol = server.login("carol@example.com").await;
    let status = carol.toggle_user(common::id(3)).await.unwrap_err();
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn deactivated_executor_is_not_offered() {
    let server = common::Server::start().await;
    let carol = server.login("carol@example.com").await;
    carol.toggle_user(common::id(5)).await.unwrap();

    let executors = carol.executors().await.unwrap();
    assert_eq!(
        executors.iter().map(|e| e.id).collect::<Vec<_>>(),
        [common::id(2)],
    );
}

#[tokio::test]
async fn summarizes_own_tickets() {
    let server = common::Server::start().await;
    let alice = server.login("alice@example.com").await;
    alice.add_ticket("Tap").await.unwrap();
    alice.add_ticket("Door").await.unwrap();

    let stats = alice.user_stats().await.unwrap();
    assert_eq!(stats["role"], "customer");
    assert_eq!(stats["counts"]["total"], 2);
    assert_eq!(stats["counts"]["pending"], 2);
}
