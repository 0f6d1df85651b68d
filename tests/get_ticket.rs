pub mod common;

use reqwest::{multipart::Form, StatusCode};

#[tokio::test]
async fn retrieves_ticket() {
    let server = common::Server::start().await;
    let alice = server.login("alice@example.com").await;
    let ticket = alice.add_ticket("Leaking tap").await.unwrap();

    assert_eq!(alice.get_ticket(ticket.id).await.unwrap(), ticket);

    let carol = server.login("carol@example.com").await;
    assert_eq!(carol.get_ticket(ticket.id).await.unwrap(), ticket);
}

#[tokio::test]
async fn other_customer_cant_read_ticket() {
    let server = common::Server::start().await;
    let alice = server.login("alice@example.com").await;
    let ticket = alice.add_ticket("Leaking tap").await.unwrap();

    let dave = server.login("dave@example.com").await;
    let status = dave.get_ticket(ticket.id).await.unwrap_err();
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn executor_reads_only_assigned_tickets() {
    let server = common::Server::start().await;
    let alice = server.login("alice@example.com").await;
    let ticket = alice.add_ticket("Leaking tap").await.unwrap();

    let bob = server.login("bob@example.com").await;
    let status = bob.get_ticket(ticket.id).await.unwrap_err();
    assert_eq!(status, StatusCode::FORBIDDEN);

    let carol = server.login("carol@example.com").await;
    let form = Form::new().text("executor_id", common::id(2).to_string());
    carol.edit_ticket(ticket.id, form).await.unwrap();

    assert_eq!(bob.get_ticket(ticket.id).await.unwrap().id, ticket.id);
    let erin = server.login("erin@example.com").await;
    let status = erin.get_ticket(ticket.id).await.unwrap_err();
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn fails_when_not_found() {
    let server = common::Server::start().await;
    let alice = server.login("alice@example.com").await;
    let carol = server.login("carol@example.com").await;
    let ticket = alice.add_ticket("Leaking tap").await.unwrap();
    carol.delete_ticket(ticket.id).await.unwrap();

    assert_eq!(
        alice.get_ticket(ticket.id).await.unwrap_err(),
        StatusCode::NOT_FOUND,
    );
    assert_eq!(
        carol.get_ticket(ticket.id).await.unwrap_err(),
        StatusCode::NOT_FOUND,
    );
}

#[tokio::test]
async fn fails_when_unauthorized() {
    let server = common::Server::start().await;
    let alice = server.login("alice@example.com").await;
    let ticket = alice.add_ticket("Leaking tap").await.unwrap();

    let status = server.client().get_ticket(ticket.id).await.unwrap_err();
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn reports_ticket_to_its_parties() {
    let server = common::Server::start().await;
    let alice = server.login("alice@example.com").await;
    let bob = server.login("bob@example.com").await;
    let carol = server.login("carol@example.com").await;
    let dave = server.login("dave@example.com").await;
    let ticket = alice.add_ticket("Leaking tap").await.unwrap();
    let form = Form::new().text("executor_id", common::id(2).to_string());
    carol.edit_ticket(ticket.id, form).await.unwrap();

    let form = Form::new()
        .text("status", "done")
        .text("completion_comment", "Replaced the washer");
    let done = bob.edit_ticket(ticket.id, form).await.unwrap();

    let report = alice.ticket_report(ticket.id).await.unwrap();
    assert_eq!(report.ticket, done);
    assert!(report.timing.completion_hours.is_some());
    assert_eq!(report.timing.overdue_hours, None);
    bob.ticket_report(ticket.id).await.unwrap();
    carol.ticket_report(ticket.id).await.unwrap();

    let status = dave.ticket_report(ticket.id).await.unwrap_err();
    assert_eq!(status, StatusCode::FORBIDDEN);
    let status = server.client().ticket_report(ticket.id).await.unwrap_err();
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}
