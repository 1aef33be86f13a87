use async_trait::async_trait;
use service_clients::openstack::{NewSecurityGroupRule, NewServer, OpenStackClient, OpenStackError, Server};
use crate::provisioning::compute::{ComputeApi, ComputeError, RuleProtocol, SecurityRule, ServerCreate, ServerDetails, ServerStatus};

impl From<OpenStackError> for ComputeError {
    fn from(err: OpenStackError) -> Self {
        match err {
            OpenStackError::NotFound { kind, name } => ComputeError::NotFound { kind, name },
            OpenStackError::Conflict(body) => ComputeError::Conflict(body),
            other => ComputeError::Api(other.to_string()),
        }
    }
}

fn to_details(server: Server) -> ServerDetails {
    ServerDetails {
        address: server.fixed_address(),
        status: ServerStatus::from(server.status.as_str()),
        fault: server.fault.map(|f| f.message).filter(|m| !m.is_empty()),
        id: server.id,
        name: server.name,
        host: server.host,
        instance_name: server.instance_name,
    }
}

fn to_rule(group_id: &str, rule: &SecurityRule) -> NewSecurityGroupRule {
    let (protocol, port_range) = match rule.protocol {
        RuleProtocol::Tcp(port) => ("tcp", Some((port, port))),
        RuleProtocol::Udp(port) => ("udp", Some((port, port))),
        RuleProtocol::Icmp => ("icmp", None),
    };
    NewSecurityGroupRule {
        security_group_id: group_id.to_string(),
        protocol: protocol.to_string(),
        port_range,
        remote_ip_prefix: rule.cidr.clone(),
    }
}

#[async_trait]
impl ComputeApi for OpenStackClient {
    async fn find_image(&self, region: &str, name: &str) -> Result<String, ComputeError> {
        Ok(OpenStackClient::find_image(self, region, name).await?.id)
    }

    async fn find_flavor(&self, region: &str, name: &str) -> Result<String, ComputeError> {
        Ok(OpenStackClient::find_flavor(self, region, name).await?.id)
    }

    async fn get_or_create_security_group(&self, region: &str, name: &str) -> Result<String, ComputeError> {
        match self.find_security_group(region, name).await {
            Ok(group) => Ok(group.id),
            Err(OpenStackError::NotFound { .. }) => {
                tracing::info!("creating security group {name} in {region}");
                Ok(self.create_security_group(region, name).await?.id)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn create_security_group_rule(&self, region: &str, group_id: &str, rule: &SecurityRule) -> Result<(), ComputeError> {
        OpenStackClient::create_security_group_rule(self, region, &to_rule(group_id, rule)).await?;
        Ok(())
    }

    async fn find_network(&self, region: &str, name: &str) -> Result<String, ComputeError> {
        Ok(OpenStackClient::find_network(self, region, name).await?.id)
    }

    async fn list_servers(&self, region: &str) -> Result<Vec<ServerDetails>, ComputeError> {
        let servers = OpenStackClient::list_servers(self, region).await?;
        Ok(servers.into_iter().map(to_details).collect())
    }

    async fn create_server(&self, region: &str, request: &ServerCreate) -> Result<String, ComputeError> {
        let server = NewServer {
            name: request.name.clone(),
            image_ref: request.image_id.clone(),
            flavor_ref: request.flavor_id.clone(),
            key_name: request.key_name.clone(),
            security_groups: request.security_groups.clone(),
            network_id: request.network_id.clone(),
            force_host: request.force_host.clone(),
        };
        Ok(OpenStackClient::create_server(self, region, &server).await?)
    }

    async fn get_server(&self, region: &str, id: &str) -> Result<ServerDetails, ComputeError> {
        Ok(to_details(OpenStackClient::get_server(self, region, id).await?))
    }

    async fn get_console_output(&self, region: &str, id: &str) -> Result<String, ComputeError> {
        Ok(OpenStackClient::get_console_output(self, region, id).await?)
    }
}
